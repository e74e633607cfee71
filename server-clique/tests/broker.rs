use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use server_clique::{
    broker::Broker,
    command::{Action, Command},
    error::QueueError,
    queue::{Queue, TcpQueue},
    server::{Server, ServerConfig},
    sink::ResultSink,
    table::ListOrder,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

const READ_TIMEOUT: Duration = Duration::from_secs(3);

async fn spawn_broker() -> Result<(SocketAddr, oneshot::Sender<()>, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let broker = Broker::new(listener);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        let _ = broker.run_until(shutdown).await;
    });

    Ok((addr, shutdown_tx, task))
}

#[tokio::test]
async fn consumer_receives_published_commands_in_order() -> Result<()> {
    let (addr, shutdown_tx, broker) = spawn_broker().await?;

    let publisher = TcpQueue::connect(addr, "clique").await?;
    let consumer = TcpQueue::connect(addr, "clique").await?;
    let cancel = CancellationToken::new();
    let mut deliveries = consumer.consume(cancel.clone()).await?;

    publisher.publish(&Command::add("A", "a")).await?;
    publisher.publish(&Command::remove("A")).await?;
    publisher
        .publish(&Command::new(Action::Unknown("bogus".into()), "", ""))
        .await?;

    let mut received = Vec::new();
    for _ in 0..3 {
        let command = timeout(READ_TIMEOUT, deliveries.recv())
            .await?
            .expect("delivery stream ended early");
        received.push((command.action, command.key));
    }
    assert_eq!(
        received,
        [
            (Action::Add, "A".to_string()),
            (Action::Remove, "A".to_string()),
            (Action::Unknown("bogus".into()), String::new()),
        ]
    );

    cancel.cancel();
    let end = timeout(READ_TIMEOUT, deliveries.recv()).await?;
    assert!(end.is_none());

    publisher.close().await?;
    consumer.close().await?;
    assert!(matches!(
        publisher.publish(&Command::get("A")).await,
        Err(QueueError::Closed)
    ));

    let _ = shutdown_tx.send(());
    let _ = broker.await;
    Ok(())
}

#[tokio::test]
async fn connect_fails_without_a_broker() -> Result<()> {
    // Grab a free port, then release it so nothing is listening there.
    let addr = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;

    let result = TcpQueue::connect(addr, "clique").await;
    assert!(matches!(result, Err(QueueError::Connect { .. })));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_applies_commands_from_the_broker() -> Result<()> {
    let (addr, shutdown_tx, broker) = spawn_broker().await?;

    let publisher = TcpQueue::connect(addr, "clique").await?;
    let transport = TcpQueue::connect(addr, "clique").await?;

    let (sink_writer, sink_reader) = tokio::io::duplex(64 * 1024);
    let server = Server::new(
        transport,
        ResultSink::new(sink_writer),
        ServerConfig {
            workers: 1,
            pipe_capacity: 1,
            list_order: ListOrder::Timestamp,
        },
    );
    let table = server.table();
    let cancel = CancellationToken::new();
    let run = tokio::spawn(server.run(cancel.clone()));

    let commands = [
        Command::add("A", "a"),
        Command::add("B", "b"),
        Command::remove("A"),
        Command::get("A"),
        Command::get_all(),
    ];
    for command in &commands {
        publisher.publish(command).await?;
    }

    let mut lines = BufReader::new(sink_reader).lines();
    let mut output = Vec::new();
    while output.len() < commands.len() {
        let line = timeout(READ_TIMEOUT, lines.next_line())
            .await??
            .expect("sink closed early");
        output.push(line);
    }
    assert_eq!(output[3], "performed action:get key:A found:false");
    assert_eq!(output[4], "performed action:getall items:[B=b] itemsLength:1");

    cancel.cancel();
    let report = timeout(READ_TIMEOUT, run).await???;
    assert_eq!(report.admitted, commands.len());
    assert_eq!(report.applied, commands.len());
    assert_eq!(table.get("B").as_deref(), Some("b"));
    assert_eq!(table.len(), 1);

    // The coordinator shut the sink down on its way out.
    assert!(timeout(READ_TIMEOUT, lines.next_line()).await??.is_none());

    publisher.close().await?;
    let _ = shutdown_tx.send(());
    let _ = broker.await;
    Ok(())
}

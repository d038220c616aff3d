use lazyq::{queue_stats, Client, MemoryStorage, Server};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Everything in-process: handy for trying the API without Redis.
    let storage = MemoryStorage::new();

    let client = Client::new(storage.clone());
    client
        .enqueue_after("reminders", "ping in two seconds", Duration::from_secs(2))
        .await?;

    let server = Server::new(storage.clone());
    server
        .register("reminders", |payload| async move {
            println!("reminder fired: {}", String::from_utf8_lossy(&payload));
            Ok(())
        })
        .await?;

    let srv = server.clone();
    let run = tokio::spawn(async move { srv.run().await });

    for _ in 0..4 {
        let stats = queue_stats(&storage, "reminders").await?;
        println!(
            "running={} delayed={} dead={}",
            stats.running, stats.delayed, stats.dead
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    server.graceful_stop();
    run.await??;
    Ok(())
}

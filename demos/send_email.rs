use lazyq::{Client, RedisStorage, Server};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct Email {
    to: String,
    subject: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let storage = RedisStorage::new("redis://localhost:6379")?;

    // Produce a few jobs.
    let client = Client::new(storage.clone());
    for i in 0..5 {
        let email = Email {
            to: format!("user{}@example.com", i),
            subject: "Welcome".to_string(),
        };
        client.enqueue("emails", serde_json::to_vec(&email)?).await?;
    }

    // Consume them.
    let server = Server::new(storage);
    server
        .register("emails", |payload| async move {
            let email: Email = serde_json::from_slice(&payload)
                .map_err(|e| lazyq::LazyqError::Handler(e.to_string()))?;
            println!("sending {:?} to {}", email.subject, email.to);
            Ok(())
        })
        .await?;

    let stopper = server.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        stopper.graceful_stop();
    });

    server.run().await?;
    Ok(())
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for MongoDB.
//!
//! Change streams need a replica set, so the container runs `mongod
//! --replSet` and is initiated as a single-member set after startup.

use mongodb::bson::doc;
use mongodb::{Client, Database};
use std::time::Duration;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage, RunnableImage};

const REPLICA_SET: &str = "rs0";

/// Create a single-node MongoDB replica set container.
///
/// Uses the official mongo:7 image. Waits for "Waiting for connections".
pub fn mongo_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("mongo", "7")
        .with_exposed_port(27017)
        .with_wait_for(WaitFor::message_on_stdout("Waiting for connections"));
    let args = vec![
        "--replSet".to_string(),
        REPLICA_SET.to_string(),
        "--bind_ip_all".to_string(),
    ];
    docker.run(RunnableImage::from((image, args)))
}

/// Connection string for a container (direct, skips replica set discovery).
pub fn mongo_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(27017);
    format!("mongodb://127.0.0.1:{}/?directConnection=true", port)
}

/// Helper struct for a MongoDB replica set ready for change streams.
pub struct TestMongo<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub client: Client,
    pub url: String,
}

impl<'a> TestMongo<'a> {
    /// Start a container and initiate the replica set.
    pub async fn new(docker: &'a Cli) -> Self {
        let container = mongo_container(docker);
        let url = mongo_url(&container);
        let client = Client::with_uri_str(&url).await.expect("Failed to connect");

        client
            .database("admin")
            .run_command(doc! { "replSetInitiate": {} })
            .await
            .expect("replSetInitiate failed");
        wait_for_primary(&client).await;

        Self {
            container,
            client,
            url,
        }
    }

    pub fn database(&self, name: &str) -> Database {
        self.client.database(name)
    }
}

/// Poll `hello` until the node reports itself writable.
async fn wait_for_primary(client: &Client) {
    for _ in 0..100 {
        let reply = client
            .database("admin")
            .run_command(doc! { "hello": 1 })
            .await;
        if let Ok(reply) = reply {
            if reply.get_bool("isWritablePrimary").unwrap_or(false) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    panic!("replica set never elected a primary");
}

use futures::future::join_all;
use tracing::Level;
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt, Layer};

use seqid::{counter::RedisConfig, Generators, IdGenerator};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter::Targets::new().with_target("seqid", Level::DEBUG)),
        )
        .init();

    let generators = Generators::new();

    let redis = generators
        .redis(RedisConfig::default())
        .await
        .expect("create redis generator error");
    let etcd = generators
        .etcd_from_connection_string("localhost:2379/seqid")
        .await
        .expect("create etcd generator error");

    for generator in [&redis, &etcd] {
        let ids = join_all((0..10).map(|_| generator.next_id("demo/orders"))).await;
        for id in ids {
            match id {
                Ok(id) => println!("{:?}: {id}", generator.signature()),
                Err(e) => eprintln!("next id error: {e:?}"),
            }
        }
        println!(
            "current: {:?}",
            generator.current_id("demo/orders").await.map_err(|e| e.to_string())
        );
    }

    generators.shutdown().await;
}

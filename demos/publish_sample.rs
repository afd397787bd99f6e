use lapin::{BasicProperties, Connection, ConnectionProperties, options::*, types::ShortString};
use queue_chain::config::Config;
use secrecy::ExposeSecret;

// Publishes a handful of messages covering the interesting paths: a normal
// one, a low-priority one the filter drops, a bypass source, and a payload
// that is not JSON at all.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    let uri = config.broker.amqp_uri()?;
    let queue = config.transport.input_queue.clone();

    println!("Connecting to {}...", config.broker.redacted_endpoint());
    let connection =
        Connection::connect(uri.expose_secret(), ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    channel.confirm_select(ConfirmSelectOptions::default()).await?;

    let samples: Vec<(&str, String)> = vec![
        (
            "sample-1",
            r#"{"name":"alpha","priority":7,"source":"demo"}"#.to_string(),
        ),
        (
            "sample-2",
            r#"{"name":"beta","priority":1,"source":"demo"}"#.to_string(),
        ),
        (
            "sample-3",
            r#"{"name":"gamma","priority":0,"source":"critical-system"}"#.to_string(),
        ),
        ("sample-4", "this is not json".to_string()),
    ];

    println!("Publishing {} messages to '{}'...", samples.len(), queue);

    for (id, body) in samples {
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type(ShortString::from("application/json"))
            .with_message_id(ShortString::from(id));

        let confirm = channel
            .basic_publish(
                "",
                &queue,
                BasicPublishOptions::default(),
                body.as_bytes(),
                properties,
            )
            .await?
            .await?;

        if confirm.is_nack() {
            println!("Broker refused {}", id);
        } else {
            println!("Published {}", id);
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;
    }

    println!("Done!");
    connection.close(200, "Normal shutdown").await?;
    Ok(())
}

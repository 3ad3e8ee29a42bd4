//! Sends an SMS through the `ring` telepathy connection manager against a
//! simulated modem and waits for the resulting signals.
//!
//! Needs the session bus with `ring` activatable, a running ofono with a
//! phonesim modem on 127.0.0.1, and `phonesim` on the `PATH`.
//!
//! ```text
//! RINGSIDE_VERBOSE=1 cargo run --example send_message
//! ```

use std::collections::HashMap;

use clap::Parser;
use ringside::{
    Config, Error, ExitOnPrecondition, Harness, MethodCall, Pattern, Session, Value, kinds,
};
use tracing_subscriber::EnvFilter;
use zbus::zvariant::{ObjectPath, Value as Variant};

const CONTACT_ID: &str = "+321234567";

const CM_BUS_NAME: &str = "org.freedesktop.Telepathy.ConnectionManager.ring";
const CM_PATH: &str = "/org/freedesktop/Telepathy/ConnectionManager/ring";
const CM: &str = "org.freedesktop.Telepathy.ConnectionManager";
const CONN: &str = "org.freedesktop.Telepathy.Connection";
const CONN_REQUESTS: &str = "org.freedesktop.Telepathy.Connection.Interface.Requests";
const CHANNEL_TYPE_TEXT: &str = "org.freedesktop.Telepathy.Channel.Type.Text";
const CHANNEL_MESSAGES: &str = "org.freedesktop.Telepathy.Channel.Interface.Messages";
const CHANNEL: &str = "org.freedesktop.Telepathy.Channel";

const CONN_STATUS_CONNECTED: u32 = 0;
const CONN_STATUS_DISCONNECTED: u32 = 2;
const CSR_REQUESTED: u32 = 1;
const HT_CONTACT: u32 = 1;
const MT_NORMAL: u32 = 0;

#[derive(Debug, Parser)]
#[command(about = "Send an SMS through ring against phonesim")]
struct Args {
    /// Echo every observed event to stdout.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ringside::Result {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = Config::from_env();
    let verbose = config.verbose() || args.verbose;
    config = config.with_verbose(verbose);

    let mut harness = Harness::connect(config).await.exit_on_precondition()?;
    if let Err(e) = harness.bring_online(0).await {
        harness.finish().await;
        return Err(e);
    }

    let _ = harness.run_case("send message", async |s| send_message(s).await).await;

    let summary = harness.finish().await;
    println!("{summary}");
    if summary.is_success() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

async fn send_message(s: &mut Session<'_>) -> ringside::Result {
    let (bus_name, conn_path) = request_connection(s).await?;
    s.track_disconnect(bus_name.as_str(), conn_path.as_str(), CONN);
    let conn = |interface: &str, method: &str| {
        MethodCall::new(bus_name.as_str(), conn_path.as_str(), interface, method)
    };

    s.call(conn(CONN, "Connect"), ());
    s.queue()
        .expect(
            Pattern::new(kinds::DBUS_SIGNAL)
                .field("signal", "StatusChanged")
                .field("args", vec![CONN_STATUS_CONNECTED, CSR_REQUESTED]),
        )
        .await?;

    let request: HashMap<&'static str, Variant<'static>> = HashMap::from([
        (
            "org.freedesktop.Telepathy.Channel.ChannelType",
            Variant::from(CHANNEL_TYPE_TEXT),
        ),
        (
            "org.freedesktop.Telepathy.Channel.TargetHandleType",
            Variant::from(HT_CONTACT),
        ),
        (
            "org.freedesktop.Telepathy.Channel.TargetID",
            Variant::from(CONTACT_ID),
        ),
    ]);
    s.call(conn(CONN_REQUESTS, "CreateChannel"), (request,));

    let new_channels = s
        .queue()
        .expect(Pattern::new(kinds::DBUS_SIGNAL).field("signal", "NewChannels"))
        .await?;
    let (channel_path, props) = first_channel(new_channels.arg(0))?;
    check(
        props.get(&Value::from("org.freedesktop.Telepathy.Channel.TargetID"))
            == Some(&Value::from(CONTACT_ID)),
        "channel targets the requested contact",
    )?;
    check(
        props.get(&Value::from("org.freedesktop.Telepathy.Channel.Requested"))
            == Some(&Value::from(true)),
        "channel is marked as requested",
    )?;

    let header: HashMap<&'static str, Variant<'static>> =
        HashMap::from([("message-type", Variant::from(MT_NORMAL))]);
    let body: HashMap<&'static str, Variant<'static>> = HashMap::from([
        ("content-type", Variant::from("text/plain")),
        ("content", Variant::from("Oh hi")),
    ]);
    s.call(
        MethodCall::new(bus_name.as_str(), channel_path.as_str(), CHANNEL_MESSAGES, "SendMessage"),
        (vec![header, body], 0u32),
    );

    let sent = s
        .queue()
        .expect(
            Pattern::new(kinds::DBUS_SIGNAL)
                .field("signal", "MessageSent")
                .field("path", channel_path.as_str()),
        )
        .await?;
    let sent_header = sent
        .arg(0)
        .and_then(Value::as_list)
        .and_then(|parts| parts.first())
        .ok_or_else(|| Error::Assertion("MessageSent without message parts".into()))?;
    check(
        sent_header.contains(&Value::from("message-sent")),
        "sent message carries a timestamp",
    )?;
    s.queue()
        .expect(Pattern::new(kinds::DBUS_RETURN).field("method", "SendMessage"))
        .await?;

    s.call(conn(CONN, "Disconnect"), ());
    s.queue()
        .expect_many([
            Pattern::new(kinds::DBUS_SIGNAL)
                .field("signal", "StatusChanged")
                .field("args", vec![CONN_STATUS_DISCONNECTED, CSR_REQUESTED]),
            Pattern::new(kinds::DBUS_SIGNAL)
                .field("signal", "Closed")
                .field("path", channel_path.as_str())
                .predicate(|e| e.get_str("interface") == Some(CHANNEL)),
            Pattern::new(kinds::DBUS_RETURN).field("method", "Disconnect"),
        ])
        .await?;
    Ok(())
}

/// Ask the connection manager for a connection on the online modem.
async fn request_connection(s: &mut Session<'_>) -> ringside::Result<(String, String)> {
    let modem = ObjectPath::try_from(s.device().object_path()).map_err(zbus::Error::from)?;
    let params: HashMap<&'static str, Variant<'static>> =
        HashMap::from([("modem", Variant::from(modem))]);
    s.call(
        MethodCall::new(CM_BUS_NAME, CM_PATH, CM, "RequestConnection"),
        ("tel", params),
    );

    let reply = s
        .queue()
        .expect(Pattern::new(kinds::DBUS_RETURN).field("method", "RequestConnection"))
        .await?;
    let value = reply.get("value").and_then(Value::as_list).unwrap_or_default();
    match value {
        [bus_name, path] => match (bus_name.as_str(), path.as_str()) {
            (Some(bus_name), Some(path)) => Ok((bus_name.to_owned(), path.to_owned())),
            _ => Err(Error::Assertion(format!("unexpected RequestConnection reply {reply}"))),
        },
        _ => Err(Error::Assertion(format!("unexpected RequestConnection reply {reply}"))),
    }
}

/// The first `(path, properties)` entry of a `NewChannels` argument.
fn first_channel(channels: Option<&Value>) -> ringside::Result<(String, &Value)> {
    let entry = channels
        .and_then(Value::as_list)
        .and_then(|list| list.first())
        .and_then(Value::as_list);
    match entry {
        Some([path, props]) => path
            .as_str()
            .map(|p| (p.to_owned(), props))
            .ok_or_else(|| Error::Assertion("NewChannels entry without a path".into())),
        _ => Err(Error::Assertion("NewChannels without channels".into())),
    }
}

fn check(condition: bool, what: &str) -> ringside::Result {
    if condition {
        Ok(())
    } else {
        Err(Error::Assertion(what.to_owned()))
    }
}

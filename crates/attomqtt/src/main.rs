//! attomqtt - control a modem using AT commands via MQTT.

use std::path::Path;
use std::time::Duration;

use anyhow::bail;
use clap::{ArgAction, Parser};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use attomqtt::bridge::{AtBridge, AtOptions, Poller};
use tomqtt_core::mqtt::{MqttSettings, RumqttcSink};
use tomqtt_core::transport::TtyTransport;

#[derive(Parser)]
#[command(name = "attomqtt")]
#[command(about = "Control a modem using AT commands via MQTT")]
#[command(disable_help_flag = true)]
struct Args {
    /// Show help
    #[arg(long = "help", action = ArgAction::Help)]
    help: Option<bool>,

    /// MQTT host, host:port or [v6]:port
    #[arg(short = 'h', long, default_value = "localhost")]
    host: String,

    /// MQTT topic prefix (default: net/TTYNAME/)
    #[arg(short, long)]
    prefix: Option<String>,

    /// Serial baud rate
    #[arg(long, default_value_t = 115200)]
    baud: u32,

    /// MQTT QoS override (default: 0 against localhost, 1 otherwise)
    #[arg(long, value_parser = parse_qos)]
    qos: Option<rumqttc::QoS>,

    /// Pollers and quirks, comma separated: csq[=SEC], creg[=SEC],
    /// cgreg[=SEC], cops[=SEC], cnti[=SEC], simcom, detachedscan, ceer
    #[arg(short = 'o', long = "option", action = ArgAction::Append)]
    options: Vec<String>,

    /// Be more verbose (repeat for more)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// TTY device of the modem
    device: String,
}

fn parse_qos(arg: &str) -> Result<rumqttc::QoS, String> {
    match arg {
        "0" => Ok(rumqttc::QoS::AtMostOnce),
        "1" => Ok(rumqttc::QoS::AtLeastOnce),
        "2" => Ok(rumqttc::QoS::ExactlyOnce),
        _ => Err(format!("invalid qos '{arg}'")),
    }
}

const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(10);

fn parse_options(args: &[String]) -> anyhow::Result<AtOptions> {
    let mut options = AtOptions::default();
    for list in args {
        for item in list.split(',').filter(|s| !s.is_empty()) {
            let (name, period) = match item.split_once('=') {
                Some((name, secs)) => {
                    let secs: u64 = secs.parse()?;
                    (name, Duration::from_secs(secs))
                }
                None => (item, DEFAULT_POLL_PERIOD),
            };
            let poller = match name {
                "csq" => Some(Poller::Csq),
                "creg" => Some(Poller::Creg),
                "cgreg" => Some(Poller::Cgreg),
                "cops" => Some(Poller::Cops),
                "cnti" => Some(Poller::Cnti),
                "simcom" => {
                    options.forced.simcom = true;
                    None
                }
                "detachedscan" => {
                    options.forced.detached_scan = true;
                    None
                }
                "ceer" => {
                    options.forced.ceer = true;
                    None
                }
                _ => bail!("unknown option '{name}'"),
            };
            if let Some(poller) = poller {
                options.pollers.retain(|(p, _)| *p != poller);
                options.pollers.push((poller, period));
            }
        }
    }
    Ok(options)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let prefix = args.prefix.clone().unwrap_or_else(|| {
        let name = Path::new(&args.device)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| args.device.clone());
        format!("net/{name}/")
    });

    let options = parse_options(&args.options)?;
    let settings = MqttSettings::new(&args.host, "attomqtt", args.qos);
    let (client, eventloop) = settings.session();

    let transport = TtyTransport::new(&args.device, args.baud);
    let sink = RumqttcSink::new(client.clone(), settings.qos);
    let bridge = AtBridge::new(prefix, options, sink, Box::new(transport));

    bridge.run(client, eventloop, settings.qos).await?;
    Ok(())
}

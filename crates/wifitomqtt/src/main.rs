//! wifitomqtt - control wpa_supplicant via MQTT.

use clap::{ArgAction, Parser};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use tomqtt_core::mqtt::{MqttSettings, RumqttcSink};
use tomqtt_core::transport::UnixDgramTransport;
use wifitomqtt::WifiBridge;

#[derive(Parser)]
#[command(name = "wifitomqtt")]
#[command(about = "Control wpa_supplicant via MQTT")]
#[command(disable_help_flag = true)]
struct Args {
    /// Show help
    #[arg(long = "help", action = ArgAction::Help)]
    help: Option<bool>,

    /// MQTT host, host:port or [v6]:port
    #[arg(short = 'h', long, default_value = "localhost")]
    host: String,

    /// Interface to control
    #[arg(short, long, default_value = "wlan0")]
    iface: String,

    /// Override the supplicant control socket path
    #[arg(long)]
    ctrl: Option<String>,

    /// Emit empty bgscan for AP/mesh networks; avoids warnings on
    /// devices that cannot scan while in AP or mesh mode
    #[arg(short = 'S', long = "no-ap-bgscan")]
    no_ap_bgscan: bool,

    /// MQTT QoS override (default: 0 against localhost, 1 otherwise)
    #[arg(long, value_parser = parse_qos)]
    qos: Option<rumqttc::QoS>,

    /// Be more verbose (repeat for more)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn parse_qos(arg: &str) -> Result<rumqttc::QoS, String> {
    match arg {
        "0" => Ok(rumqttc::QoS::AtMostOnce),
        "1" => Ok(rumqttc::QoS::AtLeastOnce),
        "2" => Ok(rumqttc::QoS::ExactlyOnce),
        _ => Err(format!("invalid qos '{arg}'")),
    }
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

    let settings = MqttSettings::new(&args.host, "wifitomqtt", args.qos);
    let (client, eventloop) = settings.session();

    let mut transport = UnixDgramTransport::new(&args.iface);
    if let Some(ctrl) = args.ctrl {
        transport = transport.with_ctrl_path(ctrl);
    }

    let sink = RumqttcSink::new(client.clone(), settings.qos);
    let bridge = WifiBridge::new(&args.iface, args.no_ap_bgscan, sink, Box::new(transport));

    bridge.run(client, eventloop, settings.qos).await?;
    Ok(())
}

// Jackson Coxson
// Prints lockdown values of a device and optionally checks that a service starts

use std::{net::IpAddr, str::FromStr, sync::Arc, time::Duration};

use idevice_lockdown::{
    pairing_file::PairingFile,
    pretty_print_dictionary,
    provider::{DeviceSource, IdeviceProvider, TcpProvider},
    usbmuxd::UsbmuxdAddr,
    LockdownConfig, LockdownSession,
};

const LABEL: &str = "lockdown_info";

#[tokio::main]
async fn main() {
    env_logger::init();
    let mut udid = None;
    let mut host = None;
    let mut pairing_file = None;
    let mut service = None;
    let mut domain = None;
    let mut pair = false;
    let mut timeout = None;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1).cloned();
        match args[i].as_str() {
            "--udid" => {
                udid = value;
                i += 2;
            }
            "--host" => {
                host = value;
                i += 2;
            }
            "--pairing-file" => {
                pairing_file = value;
                i += 2;
            }
            "--service" => {
                service = value;
                i += 2;
            }
            "--domain" => {
                domain = value;
                i += 2;
            }
            "--timeout" => {
                timeout = value.and_then(|t| t.parse::<u64>().ok());
                i += 2;
            }
            "--pair" => {
                pair = true;
                i += 1;
            }
            "-h" | "--help" => {
                println!("lockdown_info - query lockdownd on a device");
                println!("Usage:");
                println!("  lockdown_info [options]");
                println!("Options:");
                println!("  --udid <udid>          device to use, the first one by default");
                println!("  --host <ip>            reach the device over the network instead of usbmuxd");
                println!("  --pairing-file <path>  pair record to use with --host");
                println!("  --domain <domain>      lockdown domain to dump");
                println!("  --service <id>         start and ping a service");
                println!("  --pair                 pair if the host is not trusted");
                println!("  --timeout <seconds>");
                println!("  -h, --help");
                println!("\n\nSet RUST_LOG to info, debug, warn, error, or trace to see more logs. Default is error.");
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }

    let over_network = host.is_some();
    let source: Arc<dyn DeviceSource> = match host {
        Some(host) => {
            let ip = match IpAddr::from_str(&host) {
                Ok(ip) => ip,
                Err(e) => {
                    eprintln!("Invalid host {host}: {e}");
                    return;
                }
            };
            let pairing_file = match pairing_file.map(PairingFile::read_from_file) {
                Some(Ok(p)) => Some(p),
                Some(Err(e)) => {
                    eprintln!("Unable to read the pairing file: {e}");
                    return;
                }
                None => None,
            };
            let provider: Arc<dyn IdeviceProvider> = Arc::new(TcpProvider::new(
                ip,
                udid.clone().unwrap_or_default(),
                pairing_file,
                LABEL,
            ));
            Arc::new(vec![provider])
        }
        None => match UsbmuxdAddr::from_env_var() {
            Ok(addr) => Arc::new(addr),
            Err(e) => {
                eprintln!("Invalid USBMUXD_SOCKET_ADDRESS: {e}");
                return;
            }
        },
    };

    let mut config = LockdownConfig::default()
        .with_label(LABEL)
        .with_auto_pair(pair);
    if let Some(timeout) = timeout {
        config = config.with_timeout(Duration::from_secs(timeout));
    }

    let mut session = LockdownSession::new(source, config);
    // a --host device has no known udid, so take whatever the source lists
    let wanted = if over_network { None } else { udid.as_deref() };
    if let Err(e) = session.open(wanted).await {
        eprintln!("Unable to open a lockdown session: {e} ({})", e.code());
        return;
    }

    match session.device_name().await {
        Ok(name) => println!("Device: {name}"),
        Err(e) => eprintln!("Unable to get the device name: {e}"),
    }
    println!("Trust: {:?}", session.trust());

    match session.get_all_values(domain.as_deref()).await {
        Ok(values) => println!("{}", pretty_print_dictionary(&values)),
        Err(e) => eprintln!("Unable to get values: {e}"),
    }

    if let Some(service) = service {
        match session.start_service(service.as_str()).await {
            Ok(descriptor) => {
                println!(
                    "{service} started on port {} (tls: {})",
                    descriptor.port(),
                    descriptor.requires_tls()
                );
                match descriptor.ping().await {
                    Ok(()) => println!("{service} is alive"),
                    Err(e) => eprintln!("{service} did not answer: {e}"),
                }
            }
            Err(e) => eprintln!("Unable to start {service}: {e} ({})", e.code()),
        }
    }

    session.close().await;
}

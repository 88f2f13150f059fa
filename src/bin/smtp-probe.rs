use std::path::PathBuf;
use std::process;

use log::LevelFilter;
use smtp_probe::{MailSender, ProbeConfig};
use structopt::StructOpt;

/// Send one message through an SMTP relay over STARTTLS.
///
/// Settings are read from the optional JSON file, then from SMTP_PROBE_*
/// environment variables (HOST, PORT, SENDER, RECEIVER, PASSWORD, SUBJECT,
/// BODY, USERNAME, HELLO_NAME, TIMEOUT_SECS, DEBUG).
#[derive(StructOpt, Debug)]
#[structopt(name = "smtp-probe")]
struct Opt {
    /// JSON configuration file
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    config: Option<PathBuf>,

    /// Log the SMTP exchange line by line
    #[structopt(short = "d", long = "debug")]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let opt = Opt::from_args();

    let config = match ProbeConfig::load(opt.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            println!("{}", err);
            process::exit(1);
        }
    };

    init_logging(opt.debug || config.debug);

    let result = MailSender::new()
        .send(&config.connection, &config.credentials, &config.message)
        .await;

    // Silence on success, the error on stdout otherwise.
    if let Err(err) = result {
        println!("{}", err);
        process::exit(1);
    }
}

fn init_logging(debug: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if debug {
        builder.filter_module("smtp_probe", LevelFilter::Debug);
    }
    builder.init();
}

#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::Context;

use stm32_uart_boot::device::DeviceMap;
use stm32_uart_boot::{Bootloader, Options, Status};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to serve the bootloader protocol on
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "57600")]
    baud: usize,

    /// Hex-encoded image to preload at the application base
    #[structopt(long)]
    app_image: Option<String>,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "debug")]
    log_level: LevelFilter,
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let args = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(args.log_level, Config::default());

    info!("Opening serial port");

    let mut bootloader = Bootloader::linux(&args.port, args.baud, args.options)
        .map_err(|e| anyhow::anyhow!("opening serial port: {:?}", e))?;

    if let Some(image) = &args.app_image {
        let bytes = hex::decode(image).context("decoding --app-image")?;
        let base = DeviceMap::STM32F103.app_base;
        bootloader.device().load_flash(base, &bytes);
        info!("Preloaded {} bytes at 0x{:08x}", bytes.len(), base);
    }

    info!("Serving bootloader commands");

    loop {
        match bootloader.fetch_command() {
            Ok(Status::Ok) => (),
            Ok(Status::Nack) => warn!("Command fetch failed; waiting for the next frame"),
            Err(e) => return Err(anyhow::anyhow!("transport failure: {}", e)),
        }
    }
}

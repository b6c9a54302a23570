//! Command line tool: assemble descriptors from a device description, and
//! replay control requests against them.

mod logger;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use anyhow::{bail, ensure, Context, Error};
use argh::FromArgs;
use itertools::Itertools;
use log::{info, LevelFilter};
use tabled::{Table, Tabled};

use gadgetry::assembler::assemble_for;
use gadgetry::config::DeviceDescription;
use gadgetry::controller::Controller;
use gadgetry::descriptor::Registry;
use gadgetry::enumerator::{ControlOutcome, Enumerator};
use gadgetry::gadget::{EndpointHandle, HookFailure};
use gadgetry::irq::NoInterrupts;
use gadgetry::setup::SetupPacket;
use gadgetry::descriptor::Tag;
use gadgetry::usb::prelude::*;
use gadgetry::usb::{TYPE_CONFIGURATION, TYPE_DEVICE};

#[derive(FromArgs)]
/// Assemble USB device descriptors and replay control requests against them.
struct Args {
    /// log every request and data stage
    #[argh(switch, short = 'v')]
    verbose: bool,
    /// only log errors
    #[argh(switch, short = 'q')]
    quiet: bool,
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Dump(DumpCommand),
    Replay(ReplayCommand),
}

#[derive(FromArgs)]
/// Print the descriptors assembled from a device description
#[argh(subcommand, name = "dump")]
struct DumpCommand {
    /// device description (JSON)
    #[argh(positional)]
    file: PathBuf,
    /// configuration value to select (default: the first)
    #[argh(option, short = 'c')]
    configuration: Option<u8>,
}

#[derive(FromArgs)]
/// Feed SETUP packets to a device built from a description
#[argh(subcommand, name = "replay")]
struct ReplayCommand {
    /// device description (JSON)
    #[argh(positional)]
    file: PathBuf,
    /// SETUP packets as 16 hex digits, optionally followed by ':' and the
    /// OUT data stage in hex
    #[argh(positional)]
    setups: Vec<String>,
    /// packet size for IN data stages (default: 64)
    #[argh(option, short = 'p', default = "64")]
    packet_size: usize,
}

fn main() -> Result<(), Error> {
    let args: Args = argh::from_env();
    let level = if args.quiet {
        LevelFilter::Error
    } else if args.verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };
    logger::init(level)?;
    match args.command {
        Command::Dump(options) => dump(options),
        Command::Replay(options) => replay(options),
    }
}

#[derive(Tabled)]
struct NodeRow {
    tag: String,
    descriptor: &'static str,
    index: u8,
    length: usize,
}

fn dump(options: DumpCommand) -> Result<(), Error> {
    let description = DeviceDescription::load(&options.file)?;
    let registry = assemble_for(
            &description.device, &description.functions, options.configuration)
        .context("Failed to assemble descriptors")?;

    let rows = registry.nodes().iter().map(|node| {
        let tag = node.tag();
        NodeRow {
            tag: format!("0x{:04X}", tag.0),
            descriptor: tag.descriptor_type().description(),
            index: tag.index(),
            length: node.length(),
        }
    });
    println!("{}", Table::new(rows));
    println!();
    print_fields(&registry, description.device.speed);
    println!();
    for node in registry.nodes() {
        println!("{}:", node.tag());
        for line in hex_lines(node.payload()) {
            println!("    {line}");
        }
    }
    Ok(())
}

fn print_fields(registry: &Registry, speed: Speed) {
    let strings = registry.strings();
    let device_tag = Tag::new(TYPE_DEVICE, 0);
    if let Some(node) = registry.find(device_tag) {
        let device = DeviceDescriptor::from_bytes(node.payload());
        println!("Device descriptor:");
        for i in 0..DeviceDescriptor::NUM_FIELDS {
            println!("    {}", device.field_text(DeviceField(i as u8), &strings));
        }
    }
    for node in registry.nodes() {
        if node.tag().type_code() != TYPE_CONFIGURATION {
            continue;
        }
        let Some(config) = Configuration::from_bytes(node.payload()) else {
            continue;
        };
        println!("Configuration {}:", config.descriptor.config_value);
        for i in 0..ConfigDescriptor::NUM_FIELDS {
            println!("    {}",
                     config.descriptor
                         .field_text(ConfigField(i as u8), &strings, speed));
        }
        for (number, interface) in config.interfaces.entries() {
            println!("    Interface {}:", number.0);
            for i in 0..InterfaceDescriptor::NUM_FIELDS {
                println!("        {}", interface.descriptor
                    .field_text(InterfaceField(i as u8), &strings));
            }
            for endpoint in &interface.endpoint_descriptors {
                println!("        Endpoint {}:", endpoint.endpoint_address);
                for i in 0..EndpointDescriptor::NUM_FIELDS {
                    println!("            {}",
                             endpoint.field_text(EndpointField(i as u8)));
                }
            }
        }
    }
}

fn hex_lines(bytes: &[u8]) -> Vec<String> {
    bytes
        .chunks(16)
        .map(|chunk| chunk.iter().map(|b| format!("{b:02X}")).join(" "))
        .collect()
}

fn parse_hex(text: &str) -> Result<Vec<u8>, Error> {
    ensure!(text.is_ascii() && text.len() % 2 == 0,
            "'{text}' is not a sequence of hex bytes");
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16)
            .with_context(|| format!("Invalid hex byte in '{text}'")))
        .collect()
}

fn parse_setup(text: &str) -> Result<([u8; 8], Vec<u8>), Error> {
    let (setup, data) = text.split_once(':').unwrap_or((text, ""));
    let setup = parse_hex(setup)?;
    let Ok(setup) = <[u8; 8]>::try_from(setup.as_slice()) else {
        bail!("A SETUP packet is 8 bytes, got {} in '{text}'", setup.len());
    };
    Ok((setup, parse_hex(data)?))
}

/// Stands in for a device controller, logging what it is asked to do.
#[derive(Default)]
struct LoggingController {
    halted: Mutex<BTreeSet<EndpointAddr>>,
}

impl Controller for LoggingController {
    fn set_address(&self, address: DeviceAddr) {
        info!("Controller: address {}", address.0);
    }

    fn set_halt(&self, endpoint: EndpointAddr, halted: bool)
        -> Result<(), HookFailure>
    {
        info!("Controller: endpoint {endpoint} {}",
              if halted { "halted" } else { "resumed" });
        let mut set = self.halted.lock().unwrap_or_else(PoisonError::into_inner);
        if halted {
            set.insert(endpoint);
        } else {
            set.remove(&endpoint);
        }
        Ok(())
    }

    fn halted(&self, endpoint: EndpointAddr) -> Result<bool, HookFailure> {
        Ok(self.halted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&endpoint))
    }

    fn enable_endpoints(&self, endpoints: &[EndpointHandle])
        -> Result<(), HookFailure>
    {
        info!("Controller: enabling endpoints {}",
              endpoints.iter().map(|handle| handle.address).join(", "));
        Ok(())
    }

    fn disable_endpoints(&self) {
        info!("Controller: endpoints disabled");
    }
}

#[derive(Tabled)]
struct CounterRow {
    counter: &'static str,
    value: u64,
}

fn replay(options: ReplayCommand) -> Result<(), Error> {
    ensure!(options.packet_size > 0, "Packet size must be non-zero");
    let description = DeviceDescription::load(&options.file)?;
    let enumerator = Enumerator::new(
            description.device,
            description.functions,
            LoggingController::default(),
            NoInterrupts)
        .context("Failed to assemble descriptors")?;

    for text in &options.setups {
        let (bytes, data) = parse_setup(text)?;
        let setup = SetupPacket::decode(&bytes);
        println!("{}", setup.summary());
        let mut outcome = enumerator.handle_setup(&bytes);
        if let ControlOutcome::ReceiveData(expected) = outcome {
            if data.len() < expected {
                println!("    {} bytes of OUT data given, {expected} expected",
                         data.len());
            }
            outcome = enumerator.write_out(setup.words(), &data);
        }
        match outcome {
            ControlOutcome::Data(length) => {
                let mut packet = vec![0; options.packet_size];
                let mut response = Vec::with_capacity(length);
                while enumerator.status().transfer_pending {
                    match enumerator.read_in(setup.words(), &mut packet) {
                        Ok(count) => response.extend_from_slice(&packet[..count]),
                        Err(reason) => {
                            println!("    Data stage failed: {reason}");
                            break;
                        }
                    }
                }
                println!("    IN, {} bytes:", response.len());
                for line in hex_lines(&response) {
                    println!("        {line}");
                }
            },
            ControlOutcome::ReceiveData(remaining) =>
                println!("    Incomplete, {remaining} bytes of OUT data missing"),
            ControlOutcome::Status => println!("    OK"),
            ControlOutcome::Stall(reason) => println!("    STALL: {reason}"),
        }
    }

    let status = enumerator.status();
    println!();
    println!("State: {:?}, address {}, configuration {}",
             status.state, status.address.0, status.configuration);
    let stats = enumerator.statistics();
    let rows = [
        CounterRow { counter: "SETUP packets", value: stats.setups },
        CounterRow { counter: "Stalls", value: stats.stalls },
        CounterRow { counter: "Aborted transfers", value: stats.aborted },
        CounterRow { counter: "Bytes sent", value: stats.bytes_sent },
        CounterRow { counter: "Registry swaps", value: stats.registry_swaps },
    ];
    println!("{}", Table::new(rows));
    Ok(())
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! hecal-topic-echo - Echo topic messages in real-time
//!
//! Like `rostopic echo` for hecal topics: subscribe and print every
//! message with its clock, timestamp and source.

use clap::Parser;
use colored::Colorize;
use hecal::{DataTypeInformation, Node};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Echo topic messages in real-time
#[derive(Parser, Debug)]
#[command(name = "hecal-topic-echo")]
#[command(version)]
#[command(about = "Echo topic messages (like rostopic echo)")]
struct Args {
    /// Topic name to subscribe to
    topic: String,

    /// Domain ID
    #[arg(short, long, default_value = "0")]
    domain: u16,

    /// Maximum number of messages to receive (0 = unlimited)
    #[arg(short = 'n', long, default_value = "0")]
    count: u64,

    /// Print payloads as a hex dump instead of lossy UTF-8
    #[arg(long)]
    hex: bool,

    /// Quiet mode - only payloads, no metadata
    #[arg(short, long)]
    quiet: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

fn main() {
    let args = Args::parse();
    if args.no_color {
        colored::control::set_override(false);
    }

    let node = match Node::builder("hecal-topic-echo")
        .domain_id(args.domain)
        .build()
    {
        Ok(node) => node,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            std::process::exit(1);
        }
    };

    let subscriber = match node.create_subscriber(&args.topic, DataTypeInformation::raw()) {
        Ok(subscriber) => subscriber,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            std::process::exit(1);
        }
    };

    if !args.quiet {
        println!(
            "{} {} (domain {})",
            "listening on".green(),
            args.topic.bold(),
            args.domain
        );
    }

    let received = Arc::new(AtomicU64::new(0));
    {
        let received = Arc::clone(&received);
        let hex = args.hex;
        let quiet = args.quiet;
        subscriber.set_receive_callback(move |topic, _datatype, data| {
            let n = received.fetch_add(1, Ordering::AcqRel) + 1;
            if !quiet {
                println!(
                    "{} clock={} time_us={} from={}",
                    format!("[{n}]").cyan(),
                    data.clock,
                    data.time_us,
                    topic.host_name
                );
            }
            if hex {
                for chunk in data.buffer.chunks(16) {
                    let bytes: Vec<String> =
                        chunk.iter().map(|b| format!("{b:02x}")).collect();
                    println!("  {}", bytes.join(" "));
                }
            } else {
                println!("{}", String::from_utf8_lossy(data.buffer));
            }
        });
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            running.store(false, Ordering::Release);
        })
        .expect("install signal handler");
    }

    while running.load(Ordering::Acquire) {
        if args.count > 0 && received.load(Ordering::Acquire) >= args.count {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    if !args.quiet {
        println!(
            "{} {} message(s)",
            "received".green(),
            received.load(Ordering::Acquire)
        );
    }
    node.shutdown();
}

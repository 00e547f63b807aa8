use std::env;

use lan_relay::{peer, server};

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "server" => {
                println!("Starting relay...");
                if let Err(e) = server::main(&args[2..]) {
                    println!("Relay error:\n{:#}", e);
                    std::process::exit(1);
                }
            }
            "peer" => {
                match peer::main(&args[2..]) {
                    Ok(_) => println!("Left the meeting"),
                    Err(e) => {
                        println!("Peer error:\n{:#}", e);
                        std::process::exit(1);
                    }
                }
            }
            _ => {
                print_usage();
            }
        }
    } else {
        print_usage();
    }
}

fn print_usage() {
    println!("LAN Relay");
    println!("Usage:");
    println!("  lan-relay server [--host H] [--tcp-port N] [--udp-port N]  - Start the relay");
    println!("  lan-relay peer <server-ip> <name> [--tcp-port N] [--udp-port N]  - Join as a peer");
}

//! Key tool for SKUD DESFire deployments
//!
//! Reads the same environment as the server, so the keys it prints are the
//! keys the server will expect on the card.
//!
//! Usage:
//!   skud-keytool derive <card-uid>
//!   skud-keytool generate-master [--upper]

use std::env;
use std::process;

use skud_access::card::normalize_uid;
use skud_access::crypto::{random_hex, KeyDerivation};
use skud_access::Config;

fn usage() {
    println!("skud-keytool {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Commands:");
    println!("  derive <card-uid>          Print the AES key for a card (uses DESFIRE_MASTER_KEY)");
    println!("  generate-master [--upper]  Print a fresh random 16-byte master key");
    println!("  help                       Show this message");
}

fn derive(uid: &str) -> Result<String, String> {
    let uid = normalize_uid(uid);
    if uid.is_empty() || hex::decode(&uid).is_err() {
        return Err(format!("card uid must be hex, got {:?}", uid));
    }
    let config = Config::from_env().map_err(|e| e.to_string())?;
    if config.dev_master_key {
        eprintln!("Warning: DESFIRE_MASTER_KEY not set, using the development master key");
    }
    let kdf = KeyDerivation::new(&config.master_key).map_err(|e| e.to_string())?;
    Ok(kdf.derive_hex(&uid))
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("help");

    match command {
        "derive" => {
            let Some(uid) = args.get(1) else {
                eprintln!("Error: derive needs a card uid");
                process::exit(1);
            };
            match derive(uid) {
                Ok(key) => println!("{}", key),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    process::exit(1);
                }
            }
        }
        "generate-master" => {
            let key = random_hex(16);
            if args.iter().any(|a| a == "--upper") {
                println!("{}", key.to_ascii_uppercase());
            } else {
                println!("{}", key);
            }
        }
        "help" | "--help" | "-h" => usage(),
        other => {
            eprintln!("Error: unknown command {:?}", other);
            usage();
            process::exit(1);
        }
    }
}

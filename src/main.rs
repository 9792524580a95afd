#[macro_use]
extern crate log;
extern crate ring_dht;
extern crate simplelog;

use simplelog::{ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use ring_dht::sim::SimNetwork;
use ring_dht::{Config, FetchOutcome, Identifier, Outcome, PingTarget};

const RING_SIZE: usize = 8;
const BASE_PORT: u16 = 8900;
const DEFAULT_DATA_TYPE: u32 = 0;
const DEFAULT_TTL_SECS: u32 = 3600;

fn node_addr(index: usize) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], BASE_PORT + index as u16))
}

fn add_node(sim: &mut SimNetwork, bootstrap: Option<usize>) -> usize {
    let index = sim.len();
    let id = Identifier::hash(&format!("node-{}", index));
    let node = sim.add_node(id, node_addr(index), Config::default());
    let result = match bootstrap {
        Some(via) => {
            let addr = *sim.node(via).listen_addr();
            sim.node_mut(node).bootstrap(&addr)
        },
        None => sim.node_mut(node).listen(),
    };
    if let Err(err) = result {
        error!("could not start node {}: {}", index, err);
    }
    sim.run();
    node
}

fn print_outcomes(sim: &mut SimNetwork, index: usize) {
    for outcome in sim.node_mut(index).take_outcomes() {
        match outcome {
            Outcome::Retrieved(object) => {
                println!("{} => {}", object.key, String::from_utf8_lossy(&object.payload))
            },
            Outcome::Listed(entries) => {
                for entry in entries {
                    println!("{} (type {})", entry.key, entry.data_type);
                }
            },
            Outcome::Pong(id) => println!("pong from {}", id),
        }
    }
}

fn parse_index(sim: &SimNetwork, arg: Option<&&str>) -> Option<usize> {
    let index = arg?.parse::<usize>().ok()?;
    if index < sim.len() && sim.is_alive(index) {
        Some(index)
    } else {
        None
    }
}

fn main() {
    let logger_config = ConfigBuilder::new()
        .set_time_level(LevelFilter::Error)
        .build();
    if let Err(err) = CombinedLogger::init(vec![TermLogger::new(
        LevelFilter::Info,
        logger_config,
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )]) {
        eprintln!("could not install logger: {}", err);
    }

    let mut sim = SimNetwork::new();
    add_node(&mut sim, None);
    for _ in 1..RING_SIZE {
        add_node(&mut sim, Some(0));
    }
    sim.advance(Duration::from_secs(15));

    let input = io::stdin();
    loop {
        let mut buffer = String::new();
        println!("Ready for input!");
        match input.read_line(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(_) => {},
        }
        let args: Vec<&str> = buffer.split_whitespace().collect();
        let index = parse_index(&sim, args.get(1));
        let result = match (args.first().cloned(), index) {
            (Some("new"), Some(via)) => {
                let node = add_node(&mut sim, Some(via));
                println!("added node {} ({})", node, sim.node(node).id());
                Ok(())
            },
            (Some("store"), Some(index)) if args.len() == 4 => {
                let key = Identifier::hash(args[2]);
                let value = args[3].as_bytes().to_vec();
                sim.node_mut(index)
                    .store(key, DEFAULT_DATA_TYPE, DEFAULT_TTL_SECS, value)
            },
            (Some("fetch"), Some(index)) if args.len() == 3 => {
                let key = Identifier::hash(args[2]);
                match sim.node_mut(index).fetch(key, DEFAULT_DATA_TYPE) {
                    Ok(FetchOutcome::Local(objects)) => {
                        for object in objects {
                            println!("{} => {}", key, String::from_utf8_lossy(&object.payload));
                        }
                        Ok(())
                    },
                    Ok(FetchOutcome::Routed) => Ok(()),
                    Err(err) => Err(err),
                }
            },
            (Some("ping"), Some(index)) if args.len() == 3 => {
                let target = PingTarget::Identifier(Identifier::hash(args[2]));
                sim.node_mut(index).ping(target)
            },
            (Some("dir"), Some(index)) if args.len() == 4 => {
                let low = Identifier::hash(args[2]);
                let high = Identifier::hash(args[3]);
                match sim.node_mut(index).directory(low, high) {
                    Ok(Some(entries)) => {
                        for entry in entries {
                            println!("{} (type {})", entry.key, entry.data_type);
                        }
                        Ok(())
                    },
                    Ok(None) => Ok(()),
                    Err(err) => Err(err),
                }
            },
            (Some("print"), Some(index)) => {
                sim.node(index).print_state();
                Ok(())
            },
            (Some("kill"), Some(index)) => {
                sim.kill(index);
                Ok(())
            },
            (Some("tick"), _) => {
                match args.get(1).and_then(|secs| secs.parse::<u64>().ok()) {
                    Some(secs) => sim.advance(Duration::from_secs(secs)),
                    None => println!("usage: tick <seconds>"),
                }
                Ok(())
            },
            (Some(_), _) => {
                println!(
                    "commands: new <node> | store <node> <key> <value> | fetch <node> <key> | \
                     ping <node> <key> | dir <node> <low> <high> | print <node> | kill <node> | \
                     tick <seconds>"
                );
                Ok(())
            },
            (None, _) => Ok(()),
        };
        if let Err(err) = result {
            warn!("{}", err);
        }
        sim.run();
        if let Some(index) = index {
            if sim.is_alive(index) {
                print_outcomes(&mut sim, index);
            }
        }
    }
}

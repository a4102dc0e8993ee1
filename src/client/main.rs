use std::io::Write;

use chordring::{
    config::TransportConfig,
    error::{Error, Result},
    hash::{hash_key, nearest_vnode_to_key},
    transport::{NetworkTransport, Transport},
};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let bootstrap = std::env::args()
        .nth(1)
        .ok_or(Error::Parse("missing bootstrap host argument".into()))?;
    let transport = NetworkTransport::bind(TransportConfig::new("0.0.0.0:0").with_workers(1, 1, 1)).await?;

    println!("Enter a lookup as: <key> [n].\n  Type exit to quit.");

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        if std::io::stdin().read_line(&mut input)? == 0 {
            return Ok(());
        }

        let words = input.split_whitespace().collect::<Vec<&str>>();
        let key = match words.first() {
            Some(key) if key.eq_ignore_ascii_case("exit") => return Ok(()),
            Some(key) => *key,
            None => continue,
        };
        let n = match words.get(1).map(|n| n.parse::<usize>()) {
            Some(Ok(n)) if n > 0 => n,
            None => 1,
            _ => {
                println!("n must be a positive number");
                continue;
            }
        };

        let id = hash_key(key.as_bytes());
        let vnodes = match transport.list_vnodes(&bootstrap).await {
            Ok(vnodes) => vnodes,
            Err(e) => {
                println!("Error: {}", e);
                continue;
            }
        };
        let nearest = match nearest_vnode_to_key(&vnodes, &id) {
            Some(nearest) => nearest,
            None => {
                println!("{} hosts no vnodes", bootstrap);
                continue;
            }
        };

        match transport.find_successors(nearest, n, &id).await {
            Ok(successors) => {
                println!("{} hashes to {}", key, id);
                for (idx, vnode) in successors.iter().take(n).enumerate() {
                    println!("  {}: {} on {}", idx, vnode, vnode.host);
                }
            }
            Err(e) => println!("Error: {}", e),
        }
    }
}

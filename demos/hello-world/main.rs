// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see vatkit's any_pointer.rs for the full text.

mod client;
mod server;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        println!("usage: {} [client | server] HOST:PORT", args[0]);
        return Ok(());
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, async {
        match args[1].as_str() {
            "client" => client::main(&args[2]).await,
            "server" => server::main(&args[2]).await,
            _ => {
                println!("usage: {} [client | server] HOST:PORT", args[0]);
                Ok(())
            }
        }
    })
}

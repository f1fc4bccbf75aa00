// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see vatkit's any_pointer.rs for the full text.

use std::net::ToSocketAddrs;

use vatkit::any_pointer::{self, Ptr};
use vatkit::capability::{self, Server};
use vatkit_rpc::{connect, Options};

/// The bootstrap capability: one method that mints a `Session` and hands it
/// straight back, so a caller can pipeline a call onto the session before
/// this call's own `Return` arrives.
#[derive(Clone)]
struct Greeter;

impl Server for Greeter {
    async fn dispatch_call(
        self,
        _interface_id: u64,
        _method_id: u16,
        _params: capability::Params<any_pointer::Owned>,
        mut results: capability::Results<any_pointer::Owned>,
        _context: capability::Context,
    ) -> vatkit::Result<()> {
        let session = capability::Client::new(Box::new(vatkit_rpc::local::Client::new(Session)));
        results.get().set_pointer_field(0, Ptr::Capability(session.hook));
        Ok(())
    }

    fn get_ptr(&self) -> usize {
        0
    }
}

/// Returned by `Greeter`. Its one method just confirms it was reached.
#[derive(Clone)]
struct Session;

impl Server for Session {
    async fn dispatch_call(
        self,
        _interface_id: u64,
        _method_id: u16,
        _params: capability::Params<any_pointer::Owned>,
        mut results: capability::Results<any_pointer::Owned>,
        _context: capability::Context,
    ) -> vatkit::Result<()> {
        results.get().set_pointer_field(0, Ptr::List(vec![]));
        Ok(())
    }

    fn get_ptr(&self) -> usize {
        0
    }
}

pub async fn main(addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr = addr
        .to_socket_addrs()?
        .next()
        .expect("could not parse address");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    println!("listening on {addr}");

    loop {
        let (stream, _) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let bootstrap = capability::Client::new(Box::new(vatkit_rpc::local::Client::new(Greeter)));
        let options = Options {
            bootstrap: Some(bootstrap),
            ..Options::default()
        };
        let (_system, driver) = connect(reader, writer, options);
        tokio::task::spawn_local(async move {
            if let Err(e) = driver.await {
                eprintln!("connection closed: {e:?}");
            }
        });
    }
}

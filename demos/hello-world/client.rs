// Copyright (c) 2013-2015 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see vatkit's any_pointer.rs for the full text.

use vatkit::any_pointer::{self, Ptr, PipelineOp};
use vatkit::capability;
use vatkit_rpc::{connect, Options};

pub async fn main(addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let stream = tokio::net::TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();

    let (system, driver) = connect(reader, writer, Options::default());
    tokio::task::spawn_local(async move {
        if let Err(e) = driver.await {
            eprintln!("connection closed: {e:?}");
        }
    });

    let bootstrap = system.bootstrap();
    let mut greet = bootstrap.new_call::<any_pointer::Owned, any_pointer::Owned>(0, 0, None);
    greet.get().set_pointer_field(0, Ptr::List(vec![]));
    let greet_response = greet.send();

    // The session capability is addressable the moment `send()` returns,
    // so this call goes out before `greet`'s own `Return` has come back —
    // one round trip for both calls instead of two.
    let session_hook = greet_response.pipeline.get_pipelined_cap(&[PipelineOp::field(0)]);
    let session = capability::Client::new(session_hook);
    let mut ping = session.new_call::<any_pointer::Owned, any_pointer::Owned>(0, 0, None);
    ping.get().set_pointer_field(0, Ptr::List(vec![]));

    let (_greeted, _pinged) = futures_util::future::try_join(greet_response.promise, ping.send().promise).await?;
    println!("Hello, world!");
    Ok(())
}

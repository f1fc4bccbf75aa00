// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License: see vatkit's any_pointer.rs for the full text.

//! Splits a future that resolves to a `(value, ())` pair into two
//! independently-awaitable futures: one for the value, one that just
//! signals completion. `local::Request::send` uses this to let the
//! caller's response promise and the answer's pipeline-driving future
//! progress on their own, without either one having to poll the other.

use tokio::sync::oneshot;

use vatkit::{Error, Result};

pub fn split<F, T>(
    fut: F,
) -> (
    impl std::future::Future<Output = Result<T>>,
    impl std::future::Future<Output = Result<()>>,
)
where
    F: std::future::Future<Output = Result<(T, ())>> + 'static,
    T: 'static,
{
    let (left_tx, left_rx) = oneshot::channel::<Result<T>>();
    let (right_tx, right_rx) = oneshot::channel::<Result<()>>();

    tokio::task::spawn_local(async move {
        match fut.await {
            Ok((value, ())) => {
                let _ = left_tx.send(Ok(value));
                let _ = right_tx.send(Ok(()));
            }
            Err(e) => {
                let _ = left_tx.send(Err(e.clone()));
                let _ = right_tx.send(Err(e));
            }
        }
    });

    let left = async move {
        match left_rx.await {
            Ok(result) => result,
            Err(e) => Err(crate::canceled_to_error(e)),
        }
    };
    let right = async move {
        match right_rx.await {
            Ok(result) => result,
            Err(e) => Err(crate::canceled_to_error(e)),
        }
    };
    (left, right)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn propagates_the_value_and_the_signal() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (left, right) = split(async { Ok((7u32, ())) });
                assert_eq!(left.await.unwrap(), 7);
                right.await.unwrap();
            })
            .await;
    }

    #[tokio::test]
    async fn propagates_errors_to_both_sides() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let (left, right): (_, _) =
                    split(async { Err::<(u32, ()), Error>(Error::failed("boom".into())) });
                assert!(left.await.is_err());
                assert!(right.await.is_err());
            })
            .await;
    }
}

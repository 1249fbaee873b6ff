//! Built-in dispatch targets served by `rpcchannel serve`.
//!
//! - `Calc`: integer arithmetic (`add`, `sub`, `mul`, `div`).
//! - `Ticker`: `start(int,int)` pushes `count` events to the calling session,
//!   one every `interval_ms`, then returns how many were sent.

use rpcchannel::{DispatchError, MethodRegistry, SessionHandle};
use std::time::Duration;
use tracing::debug;

/// Longest tick series a single call may request.
const MAX_TICKS: u32 = 1000;

pub fn registry(handle: &SessionHandle) -> MethodRegistry {
    let ticker = handle.clone();
    MethodRegistry::new()
        .method("Calc", "add(int,int)", |(a, b): (i64, i64)| async move {
            a.checked_add(b).ok_or_else(|| DispatchError::internal("overflow"))
        })
        .method("Calc", "sub(int,int)", |(a, b): (i64, i64)| async move {
            a.checked_sub(b).ok_or_else(|| DispatchError::internal("overflow"))
        })
        .method("Calc", "mul(int,int)", |(a, b): (i64, i64)| async move {
            a.checked_mul(b).ok_or_else(|| DispatchError::internal("overflow"))
        })
        .method("Calc", "div(int,int)", |(a, b): (i64, i64)| async move {
            a.checked_div(b).ok_or_else(|| DispatchError::internal("division by zero"))
        })
        .method("Ticker", "start(int,int)", move |(count, interval_ms): (u32, u64)| {
            let handle = ticker.clone();
            async move {
                if count > MAX_TICKS {
                    return Err(DispatchError::ParameterMismatch(format!(
                        "count must be at most {}",
                        MAX_TICKS
                    )));
                }
                for tick in 1..=count {
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                    if handle.emit("Ticker", &[tick]).await.is_err() {
                        debug!(tick, "Session gone, stopping ticker");
                        return Ok(tick - 1);
                    }
                }
                Ok(count)
            }
        })
}

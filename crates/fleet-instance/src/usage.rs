//! Resource usage from raw engine statistics.
//!
//! The engine reports cumulative CPU counters, so a usage figure needs two
//! consecutive samples. The first sample of a stream only seeds the delta.

use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::debug;

use fleet_core::{NodeUsage, ServerId};

use crate::engine::{EngineStream, RawStats};

/// CPU percentage between two samples, scaled by online cores.
///
/// Any missing counter or a non-positive delta yields 0.
pub fn cpu_percent(prev: &RawStats, current: &RawStats) -> f64 {
    let (Some(prev_system), Some(system), Some(cores)) =
        (prev.system_cpu, current.system_cpu, current.online_cpus)
    else {
        return 0.0;
    };

    let cpu_delta = current.cpu_total as f64 - prev.cpu_total as f64;
    let system_delta = system as f64 - prev_system as f64;
    if system_delta <= 0.0 || cpu_delta <= 0.0 {
        return 0.0;
    }

    (cpu_delta / system_delta) * cores as f64 * 100.0
}

/// Turn a raw statistics stream into a `NodeUsage` stream.
///
/// Ends when the raw stream ends or fails. Dropping the returned stream
/// drops the raw subscription with it.
pub fn node_usage(
    server_id: ServerId,
    raw: EngineStream<RawStats>,
) -> BoxStream<'static, NodeUsage> {
    raw.scan(None::<RawStats>, move |prev, item| {
        let next = match item {
            Ok(sample) => {
                let usage = prev.as_ref().map(|p| NodeUsage {
                    server_id,
                    cpu: cpu_percent(p, &sample),
                    ram: sample.memory_usage.unwrap_or(0),
                    at: Utc::now(),
                });
                *prev = Some(sample);
                Some(usage)
            }
            Err(e) => {
                debug!(%server_id, error = %e, "stats stream ended with error");
                None
            }
        };
        futures::future::ready(next)
    })
    .filter_map(futures::future::ready)
    .boxed()
}

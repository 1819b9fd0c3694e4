/// How many tokio worker threads to start, and where the number came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerThreads {
    pub count: usize,
    pub source: &'static str,
}

/// Resolve the worker pool size. First match wins:
/// 1. `--workers`
/// 2. `INSIGHTBRIDGE_WORKERS` ("4" or "4000m")
/// 3. cgroup v2 `cpu.max`
/// 4. cgroup v1 `cpu.cfs_quota_us` / `cpu.cfs_period_us`
/// 5. host CPU count
///
/// The tokio default is the host CPU count, which over-provisions a
/// container limited to a few cores.
pub fn resolve_worker_threads(requested: Option<usize>) -> WorkerThreads {
    if let Some(n) = requested.filter(|n| *n > 0) {
        return WorkerThreads {
            count: n,
            source: "cli",
        };
    }

    let from_env = std::env::var("INSIGHTBRIDGE_WORKERS")
        .ok()
        .and_then(|v| parse_cpu_value(&v));
    if let Some(cores) = from_env {
        return WorkerThreads {
            count: cores.max(1),
            source: "env",
        };
    }

    let cgroup_v2 = std::fs::read_to_string("/sys/fs/cgroup/cpu.max")
        .ok()
        .and_then(|max| parse_cgroup_v2_cpu(&max));
    if let Some(cores) = cgroup_v2 {
        return WorkerThreads {
            count: cores.max(1),
            source: "cgroup_v2",
        };
    }

    let cgroup_v1 = match (
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        (Ok(quota), Ok(period)) => parse_cgroup_v1_cpu(&quota, &period),
        _ => None,
    };
    if let Some(cores) = cgroup_v1 {
        return WorkerThreads {
            count: cores.max(1),
            source: "cgroup_v1",
        };
    }

    WorkerThreads {
        count: std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1),
        source: "host",
    }
}

/// "4" (cores) or "4000m" (millicores).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    match value.strip_suffix('m') {
        Some(millis) => millis.parse::<usize>().ok().map(|m| m / 1000),
        None => value.parse::<usize>().ok(),
    }
}

/// `cpu.max` is "quota period", or "max period" when unlimited.
fn parse_cgroup_v2_cpu(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?;
    if quota == "max" {
        return None;
    }
    parse_cgroup_v1_cpu(quota, period)
}

fn parse_cgroup_v1_cpu(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.trim().parse().ok()?;
    let period: i64 = period.trim().parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period) as usize)
    } else {
        None
    }
}

// Local clock sampler launched by ntpwatch for the "localhost" entry.
//
// Usage: ntpwatch-timesampler [local] <interval-ms> <duration-s>
// Prints one CSV line per interval: <realtime RFC3339 ns>,<monotonic elapsed ns>,<clock read latency ns>
// and exits once <duration-s> has elapsed so the supervisor respawns it.

use std::io::Write;
use std::time::{Instant, SystemTime};
use tokio::time::{interval, Duration, MissedTickBehavior};

#[derive(Debug, PartialEq, Eq)]
struct Args {
    interval: Duration,
    duration: Duration,
}

fn parse_args(argv: &[String]) -> anyhow::Result<Args> {
    // Le marqueur "local" est optionnel en tête
    let rest = match argv.first().map(String::as_str) {
        Some("local") => &argv[1..],
        _ => argv,
    };
    let [interval_ms, duration_s] = rest else {
        anyhow::bail!("usage: ntpwatch-timesampler [local] <interval-ms> <duration-s>");
    };
    let interval_ms: u64 = interval_ms.parse()?;
    if interval_ms == 0 {
        anyhow::bail!("interval must be > 0");
    }
    Ok(Args {
        interval: Duration::from_millis(interval_ms),
        duration: Duration::from_secs(duration_s.parse()?),
    })
}

/// One observation: realtime clock, monotonic offset since start, and the
/// cost of reading the realtime clock.
fn sample_line(start: Instant) -> String {
    let before = Instant::now();
    let now = SystemTime::now();
    let read_latency = before.elapsed();
    format!(
        "{},{},{}",
        humantime::format_rfc3339_nanos(now),
        before.duration_since(start).as_nanos(),
        read_latency.as_nanos()
    )
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&argv)?;

    let start = Instant::now();
    let mut ticker = interval(args.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stdout = std::io::stdout().lock();

    while start.elapsed() < args.duration {
        ticker.tick().await;
        // Supervisor gone: stdout closed, stop quietly.
        if writeln!(stdout, "{}", sample_line(start)).and_then(|_| stdout.flush()).is_err() {
            break;
        }
    }
    Ok(())
}

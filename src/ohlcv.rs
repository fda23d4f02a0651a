use anyhow::{Context, Result, anyhow, bail};
use chrono::{Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use futures::{StreamExt, stream};
use reqwest::{Client, header};
use serde::{Deserialize, Serialize};
use std::{env, fs, io::Write, path::Path, str::FromStr, time::Duration};
use tokio::time::sleep;
use tokio_retry::{Retry, strategy::ExponentialBackoff};
use tracing::{error, info, warn};

use fs2::FileExt; // for file locking
use std::fs::OpenOptions;
use tempfile::NamedTempFile;

use crate::FetchArgs;

/// One OHLCV candle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: NaiveDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// A time-ordered series of bars for one symbol.
#[derive(Debug, Clone)]
pub struct Series {
    pub symbol: String,
    pub bars: Vec<Bar>,
}

impl Series {
    pub fn new(symbol: impl Into<String>, mut bars: Vec<Bar>) -> Self {
        bars.sort_by_key(|b| b.time);
        Self {
            symbol: symbol.into(),
            bars,
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn opens(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.open).collect()
    }

    pub fn highs(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.high).collect()
    }

    pub fn lows(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.low).collect()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.volume).collect()
    }

    /// Median spacing between consecutive bars, in seconds. Used to
    /// annualize per-bar statistics on intraday data.
    pub fn median_bar_secs(&self) -> i64 {
        let mut gaps: Vec<i64> = self
            .bars
            .windows(2)
            .map(|w| (w[1].time - w[0].time).num_seconds())
            .filter(|g| *g > 0)
            .collect();
        if gaps.is_empty() {
            return 86_400;
        }
        gaps.sort_unstable();
        gaps[gaps.len() / 2]
    }
}

/// Candle bucket width for resampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeframe {
    M15,
    H1,
    H4,
    D1,
    W1,
}

impl Timeframe {
    pub fn secs(self) -> i64 {
        match self {
            Timeframe::M15 => 900,
            Timeframe::H1 => 3_600,
            Timeframe::H4 => 14_400,
            Timeframe::D1 => 86_400,
            Timeframe::W1 => 604_800,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
        }
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "15m" | "15min" => Ok(Timeframe::M15),
            "1h" | "1hour" => Ok(Timeframe::H1),
            "4h" | "4hour" => Ok(Timeframe::H4),
            "1d" | "1day" | "d" => Ok(Timeframe::D1),
            "1w" | "1week" | "w" => Ok(Timeframe::W1),
            other => Err(anyhow!("unknown timeframe: {other}")),
        }
    }
}

/// Parse a timestamp cell. Collector CSVs carry `YYYY-MM-DD HH:MM:SS`,
/// daily exports just `YYYY-MM-DD`.
fn parse_time(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Read a CSV into a `Series`, tolerating the messy headers the raw exports
/// carry: whitespace, mixed case, stray index columns named `unnamed: 0`.
/// The timestamp column may be called `datetime` or `date`; `volume` is
/// optional and defaults to zero.
pub fn read_series(path: &Path) -> Result<Series> {
    let mut rdr = ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("open {}", path.display()))?;

    let headers: Vec<String> = rdr
        .headers()?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();

    let col = |name: &str| headers.iter().position(|h| h == name);
    let time_idx = col("datetime")
        .or_else(|| col("date"))
        .ok_or_else(|| anyhow!("{}: no datetime/date column", path.display()))?;
    let open_idx = col("open").ok_or_else(|| anyhow!("{}: no open column", path.display()))?;
    let high_idx = col("high").ok_or_else(|| anyhow!("{}: no high column", path.display()))?;
    let low_idx = col("low").ok_or_else(|| anyhow!("{}: no low column", path.display()))?;
    let close_idx = col("close").ok_or_else(|| anyhow!("{}: no close column", path.display()))?;
    let volume_idx = col("volume");

    let mut bars = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        let Some(time) = rec.get(time_idx).and_then(parse_time) else {
            continue;
        };
        let cell = |idx: usize| -> Result<f64> {
            rec.get(idx)
                .ok_or_else(|| anyhow!("short record in {}", path.display()))?
                .parse::<f64>()
                .with_context(|| format!("bad number in {}", path.display()))
        };
        bars.push(Bar {
            time,
            open: cell(open_idx)?,
            high: cell(high_idx)?,
            low: cell(low_idx)?,
            close: cell(close_idx)?,
            volume: match volume_idx {
                Some(idx) => cell(idx).unwrap_or(0.0),
                None => 0.0,
            },
        });
    }

    let symbol = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok(Series::new(symbol, bars))
}

/// Write a series as a fresh CSV, atomically (temp file + rename).
pub fn write_series(path: &Path, series: &Series) -> Result<()> {
    fs::create_dir_all(path.parent().unwrap_or(Path::new("."))).ok();
    let mut tmp = NamedTempFile::new_in(path.parent().unwrap_or(Path::new(".")))?;
    {
        let mut wtr = WriterBuilder::new().from_writer(tmp.as_file_mut());
        wtr.write_record(["datetime", "open", "high", "low", "close", "volume"])?;
        for b in &series.bars {
            wtr.write_record(&[
                b.time.format("%Y-%m-%d %H:%M:%S").to_string(),
                format!("{:.8}", b.open),
                format!("{:.8}", b.high),
                format!("{:.8}", b.low),
                format!("{:.8}", b.close),
                format!("{:.8}", b.volume),
            ])?;
        }
        wtr.flush()?;
    }
    tmp.persist(path)?;
    Ok(())
}

/// Last bar timestamp already on disk, if any. Drives resume mode.
pub fn read_last_timestamp(path: &Path) -> Result<Option<NaiveDateTime>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut rdr = ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
    let mut last: Option<NaiveDateTime> = None;
    for rec in rdr.records() {
        let r = rec?;
        if let Some(t) = r.get(0).and_then(parse_time) {
            last = Some(t);
        }
    }
    Ok(last)
}

/// End of the bucket a timestamp falls into, right-closed and
/// right-labeled: a bar exactly on a boundary belongs to the bucket that
/// ends there. Weekly buckets run Monday through Sunday and are labeled
/// with the Sunday date.
fn bucket_end(time: NaiveDateTime, tf: Timeframe) -> NaiveDateTime {
    if tf == Timeframe::W1 {
        let days_to_sunday = 6 - time.date().weekday().num_days_from_monday() as i64;
        let sunday = time.date() + chrono::Duration::days(days_to_sunday);
        return sunday.and_hms_opt(0, 0, 0).unwrap();
    }
    let secs = tf.secs();
    let ts = time.and_utc().timestamp();
    let end = if ts % secs == 0 {
        ts
    } else {
        (ts / secs + 1) * secs
    };
    Utc.timestamp_opt(end, 0).unwrap().naive_utc()
}

/// Downsample a series to a coarser timeframe. Buckets aggregate as
/// open=first, high=max, low=min, close=last, volume=sum; empty buckets are
/// not emitted.
pub fn resample(series: &Series, tf: Timeframe) -> Series {
    let mut out: Vec<Bar> = Vec::new();
    for bar in &series.bars {
        let end = bucket_end(bar.time, tf);
        match out.last_mut() {
            Some(last) if last.time == end => {
                last.high = last.high.max(bar.high);
                last.low = last.low.min(bar.low);
                last.close = bar.close;
                last.volume += bar.volume;
            }
            _ => out.push(Bar {
                time: end,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                volume: bar.volume,
            }),
        }
    }
    Series {
        symbol: format!("{}_{}", series.symbol, tf.label()),
        bars: out,
    }
}

// ---------------------------------------------------------------------------
// Collector: pull fresh candles from the price API into per-symbol CSVs.
// ---------------------------------------------------------------------------

const API_BASE: &str = "https://public-api.birdeye.so/defi/ohlcv";

#[derive(Debug, Deserialize)]
struct ApiCandle {
    #[serde(rename = "unixTime")]
    unix_time: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    #[serde(default)]
    v: f64,
}

#[derive(Debug, Deserialize)]
struct ApiPayload {
    data: Option<ApiItems>,
}

#[derive(Debug, Deserialize)]
struct ApiItems {
    #[serde(default)]
    items: Vec<ApiCandle>,
}

pub async fn execute(args: &FetchArgs) -> Result<()> {
    let api_key = match args.api_key.clone() {
        Some(key) => key,
        None => env::var("BIRDEYE_API_KEY").context("no --api-key and BIRDEYE_API_KEY unset")?,
    };

    let out_dir = args.out.as_ref().unwrap();
    fs::create_dir_all(out_dir).context("create output dir")?;

    // Optional single-instance lock (covers daemon & cron)
    let _lock_guard = match args.lock_file.as_ref() {
        Some(lock_path) => Some(acquire_lock(lock_path)?),
        None => None,
    };

    let client = mk_client(&api_key)?;
    let tf: Timeframe = args.timeframe.as_deref().unwrap_or("15m").parse()?;
    let days_back = args.days_back.unwrap_or(3);
    let resume = args.resume.unwrap_or(false);
    let delay_ms = args.request_delay_ms.unwrap_or(250);
    let concurrency = args.concurrency.unwrap_or(4);

    let end_ts = Utc::now().timestamp();
    let start_ts = end_ts - days_back as i64 * 86_400;

    let symbols = args.symbols.clone().unwrap_or_default();
    if symbols.is_empty() {
        bail!("no symbols to fetch");
    }
    info!(
        "collecting {} symbols ({} bars, {} days back, resume={})",
        symbols.len(),
        tf.label(),
        days_back,
        resume
    );

    stream::iter(symbols)
        .map(|symbol| {
            let client = client.clone();
            let out = out_dir.clone();
            async move {
                let path = out.join(format!("{}-{}.csv", symbol, tf.label()));
                if let Err(e) =
                    update_csv_for_symbol(&client, &symbol, tf, &path, start_ts, end_ts, delay_ms, resume)
                        .await
                {
                    error!("failed {}: {}", symbol, e);
                }
            }
        })
        .buffer_unordered(concurrency)
        .collect::<Vec<_>>()
        .await;

    info!("collection complete");
    Ok(())
}

/// Acquire an exclusive file lock; keep the file handle alive to hold the lock.
pub fn acquire_lock(lock_path: &Path) -> Result<std::fs::File> {
    fs::create_dir_all(lock_path.parent().unwrap_or(Path::new("."))).ok();
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(lock_path)?;
    file.lock_exclusive()?;
    Ok(file)
}

/// HTTP client with the API key header preset.
pub fn mk_client(api_key: &str) -> Result<Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert("X-API-KEY", header::HeaderValue::from_str(api_key)?);
    let client = Client::builder()
        .default_headers(headers)
        .user_agent("rbi-lab/0.1 (rust)")
        .timeout(Duration::from_secs(30))
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .build()?;
    Ok(client)
}

/// GET with exponential backoff. Non-2xx responses count as retryable
/// failures; after the retry budget is spent the last error propagates.
async fn get_json_with_retry(client: &Client, url: reqwest::Url) -> Result<ApiPayload> {
    let backoff = ExponentialBackoff::from_millis(300)
        .max_delay(Duration::from_secs(10))
        .take(5);
    Retry::start(backoff, || async {
        let resp = client.get(url.clone()).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            warn!("{} -> {}, retrying", url, status);
            bail!("HTTP {status}");
        }
        Ok(resp.json::<ApiPayload>().await?)
    })
    .await
}

fn candle_url(symbol: &str, tf: Timeframe, from_ts: i64, to_ts: i64) -> Result<reqwest::Url> {
    Ok(reqwest::Url::parse_with_params(
        API_BASE,
        &[
            ("address", symbol.to_string()),
            ("type", tf.label().to_uppercase()),
            ("time_from", from_ts.to_string()),
            ("time_to", to_ts.to_string()),
        ],
    )?)
}

/// Fetch candles for `[from_ts..=to_ts]`, chunked so no single request asks
/// for more than 1000 bars.
pub async fn fetch_bars(
    client: &Client,
    symbol: &str,
    tf: Timeframe,
    from_ts: i64,
    to_ts: i64,
    delay_ms: u64,
) -> Result<Vec<Bar>> {
    let chunk = tf.secs() * 1000;
    let mut cur_from = from_ts;
    let mut bars = Vec::new();

    while cur_from < to_ts {
        let cur_to = (cur_from + chunk).min(to_ts);
        let url = candle_url(symbol, tf, cur_from, cur_to)?;
        let payload = get_json_with_retry(client, url).await?;
        if let Some(data) = payload.data {
            for c in data.items {
                bars.push(Bar {
                    time: Utc
                        .timestamp_opt(c.unix_time, 0)
                        .single()
                        .ok_or_else(|| anyhow!("bad timestamp {}", c.unix_time))?
                        .naive_utc(),
                    open: c.o,
                    high: c.h,
                    low: c.l,
                    close: c.c,
                    volume: c.v,
                });
            }
        }
        sleep(Duration::from_millis(delay_ms)).await;
        cur_from = cur_to + 1;
    }

    bars.sort_by_key(|b| b.time);
    bars.dedup_by_key(|b| b.time);
    Ok(bars)
}

/// Idempotent CSV update: fetch missing bars and append, or write a fresh
/// file atomically. Resume mode starts strictly after the last timestamp on
/// disk and dedupes any overlap.
#[allow(clippy::too_many_arguments)]
pub async fn update_csv_for_symbol(
    client: &Client,
    symbol: &str,
    tf: Timeframe,
    out_path: &Path,
    start_ts: i64,
    end_ts: i64,
    delay_ms: u64,
    resume: bool,
) -> Result<()> {
    fs::create_dir_all(out_path.parent().unwrap_or(Path::new("."))).ok();

    let mut eff_start_ts = start_ts;
    let last_time = if resume {
        read_last_timestamp(out_path).ok().flatten()
    } else {
        None
    };
    if let Some(lt) = last_time {
        eff_start_ts = lt.and_utc().timestamp() + 1;
        if eff_start_ts > end_ts {
            info!("{} up-to-date through {}; skipping", symbol, lt);
            return Ok(());
        }
    }

    let mut bars = fetch_bars(client, symbol, tf, eff_start_ts, end_ts, delay_ms).await?;
    if let Some(lt) = last_time {
        bars.retain(|b| b.time > lt);
    }
    if bars.is_empty() {
        info!("{} no new bars", symbol);
        return Ok(());
    }

    if out_path.exists() && resume {
        // append without headers
        let mut f = OpenOptions::new().append(true).open(out_path)?;
        for b in &bars {
            writeln!(
                f,
                "{},{:.8},{:.8},{:.8},{:.8},{:.8}",
                b.time.format("%Y-%m-%d %H:%M:%S"),
                b.open,
                b.high,
                b.low,
                b.close,
                b.volume
            )?;
        }
        f.flush()?;
    } else {
        write_series(out_path, &Series::new(symbol, bars))?;
    }

    info!("wrote {}", out_path.display());
    Ok(())
}

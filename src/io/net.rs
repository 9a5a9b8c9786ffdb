use crate::{error::Result, io::progress::ProgressSink};

use reqwest::blocking::Client;
use std::{
    fs::{self, File},
    io::{Read, Write},
    path::Path,
    time::Duration,
};
use tracing::info;

pub fn http_client() -> Client {
    Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30))
        .timeout(None)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Stream `url` into `dest`, reporting the byte ratio when the server sends
/// a length. Writes to a `.part` sibling first so a broken transfer never
/// leaves a file that looks complete.
pub fn download_with_progress(
    client: &Client,
    url: &str,
    dest: &Path,
    progress: &dyn ProgressSink,
) -> Result<()> {
    info!("fetching {}", url);
    let mut resp = client.get(url).send()?.error_for_status()?;
    let total = resp.content_length().unwrap_or(0);

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let part = dest.with_extension("part");
    let mut out = File::create(&part)?;

    let mut buf = vec![0u8; 64 * 1024];
    let mut done: u64 = 0;
    progress.report(0.0);
    loop {
        let n = resp.read(&mut buf)?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
        done += n as u64;
        if total > 0 {
            progress.report(done as f64 / total as f64);
        }
    }
    out.flush()?;
    drop(out);

    fs::rename(&part, dest)?;
    progress.report(1.0);
    info!("saved {} ({} bytes)", dest.display(), done);
    Ok(())
}

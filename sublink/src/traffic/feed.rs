use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::VecDeque;
use std::fmt;

use super::TrafficSample;

pub fn parse_sample(line: &str) -> Result<TrafficSample, serde_json::Error> {
    serde_json::from_str(line.trim())
}

/// Splits a chunked byte stream of newline-delimited JSON into samples.
///
/// Malformed lines are skipped. The stream ends when the source ends or
/// fails.
pub fn decode_samples<S, B, E>(chunks: S) -> BoxStream<'static, TrafficSample>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: fmt::Display + Send,
{
    let state = (Box::pin(chunks.fuse()), Vec::new(), VecDeque::new());

    stream::unfold(state, |(mut chunks, mut buf, mut ready)| async move {
        loop {
            if let Some(sample) = ready.pop_front() {
                return Some((sample, (chunks, buf, ready)));
            }

            match chunks.next().await {
                Some(Ok(chunk)) => {
                    buf.extend_from_slice(chunk.as_ref());
                    drain_lines(&mut buf, &mut ready);
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Traffic feed interrupted");
                    return None;
                }
                None => {
                    if buf.is_empty() {
                        return None;
                    }
                    let tail = std::mem::take(&mut buf);
                    push_line(&tail, &mut ready);
                    if ready.is_empty() {
                        return None;
                    }
                }
            }
        }
    })
    .boxed()
}

fn drain_lines(buf: &mut Vec<u8>, ready: &mut VecDeque<TrafficSample>) {
    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buf.drain(..=pos).collect();
        push_line(&line, ready);
    }
}

fn push_line(line: &[u8], ready: &mut VecDeque<TrafficSample>) {
    let Ok(text) = std::str::from_utf8(line) else {
        tracing::debug!("Skipping non UTF-8 traffic line");
        return;
    };
    if text.trim().is_empty() {
        return;
    }
    match parse_sample(text) {
        Ok(sample) => ready.push_back(sample),
        Err(e) => tracing::debug!(error = %e, "Skipping malformed traffic line"),
    }
}

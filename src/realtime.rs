//! A best-effort realtime notification channel for configuration updates.
//!
//! The listener resolves a short-lived stream endpoint through a discovery
//! call, then holds a long-lived server-sent-events connection open. The
//! channel is expected to be idle for long periods, so reads are bounded by a
//! checkpoint timeout rather than a whole-request deadline: a timed-out read
//! closes the connection and reconnects from the resume cursor, giving the
//! stop flag a regular chance to be observed. Update events carry the publish
//! timestamp of the new configuration; the actual reload happens on a
//! dedicated worker thread so a slow fetch never blocks receipt of the next
//! event.
use std::{
    io::{BufRead, BufReader},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    time::Duration,
};

use serde::Deserialize;
use url::Url;

use crate::{
    client::ConfigurationUpdater, protocol::ConfigurationLoadType, Error, Result,
};

#[derive(Deserialize)]
struct GetStreamUrlResponse {
    url: String,
}

/// Outer SSE payload; its `data` field is itself a JSON document.
#[derive(Deserialize)]
struct EventSourceMessage {
    data: String,
}

#[derive(Deserialize)]
struct ConfigurationUpdateEvent {
    published: f64,
}

/// Read checkpoint for the update stream. Bounds how long a stop request can
/// go unnoticed on an idle channel, and how long a half-dead connection
/// lingers before the reconnect resumes from the cursor.
const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Listens for configuration update events and triggers out-of-band reloads.
///
/// Any stream failure or orderly close triggers an immediate reconnect from
/// discovery, carrying the resume cursor forward. There is no backoff and no
/// retry limit: an unreachable discovery endpoint causes a tight reconnect
/// loop, so callers embedding this behind an unreliable network should add
/// their own guard.
pub(crate) struct RealtimeListener {
    stop: Arc<AtomicBool>,
}

impl RealtimeListener {
    /// Start the listener and its reload worker thread.
    pub fn start(
        edge_url: String,
        environment_id: String,
        updater: Arc<ConfigurationUpdater>,
    ) -> Result<RealtimeListener> {
        let stop = Arc::new(AtomicBool::new(false));

        let (publish_sender, publish_receiver) = mpsc::channel::<f64>();

        // Reloads are serialized on their own thread, separate from the
        // poller, so receiving the next event is never blocked by a fetch.
        std::thread::Builder::new()
            .name("appflags-realtime-reload".to_owned())
            .spawn(move || {
                while let Ok(published) = publish_receiver.recv() {
                    log::debug!(target: "appflags",
                        "notified of configuration change, retrieving updated configuration now");
                    if let Err(err) =
                        updater.reload(ConfigurationLoadType::RealtimeReload, Some(published))
                    {
                        log::warn!(target: "appflags", "realtime configuration reload failed: {:?}", err);
                    }
                }
            })?;

        // The read timeout lives on the wrapped async builder; the blocking
        // builder doesn't expose it directly.
        let stream_client = reqwest::blocking::ClientBuilder::from(
            reqwest::Client::builder().read_timeout(STREAM_READ_TIMEOUT),
        )
        // The stream is expected to idle between events, so there is no
        // whole-request deadline; the read timeout only forces a
        // stop-flag checkpoint on quiet channels.
        .timeout(None)
        .build()?;

        let mut worker = StreamWorker {
            discovery_client: reqwest::blocking::Client::new(),
            stream_client,
            edge_url,
            environment_id,
            last_event_id: None,
            publish_sender,
            stop: stop.clone(),
        };
        std::thread::Builder::new()
            .name("appflags-realtime".to_owned())
            .spawn(move || {
                while !worker.stop.load(Ordering::Acquire) {
                    match worker.run_stream() {
                        Ok(()) => {
                            log::debug!(target: "appflags", "update stream closed, reconnecting");
                        }
                        Err(err) => {
                            log::warn!(target: "appflags", "update stream failure, reconnecting: {:?}", err);
                        }
                    }
                }
            })?;

        Ok(RealtimeListener { stop })
    }

    /// Ask the listener to stop.
    ///
    /// Doesn't join the listener thread; the in-flight stream is torn down
    /// and the thread exits at the next event, stream close, or read
    /// checkpoint, whichever comes first.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

struct StreamWorker {
    discovery_client: reqwest::blocking::Client,
    stream_client: reqwest::blocking::Client,
    edge_url: String,
    environment_id: String,
    /// Resume cursor: identifier of the last received event, replayed on
    /// reconnect so no update is missed.
    last_event_id: Option<String>,
    publish_sender: mpsc::Sender<f64>,
    stop: Arc<AtomicBool>,
}

impl StreamWorker {
    /// Open one stream connection and pump events until it closes.
    fn run_stream(&mut self) -> Result<()> {
        let stream_url = self.discover_stream_url()?;
        let url = resume_url(&stream_url, self.last_event_id.as_deref())?;

        log::debug!(target: "appflags", "opening configuration update stream");
        let response = self.stream_client.get(url).send()?.error_for_status()?;

        let mut reader = BufReader::new(response);
        loop {
            let event = match next_step(&mut reader)? {
                StreamStep::Event(event) => event,
                // Dropping the response closes the connection; the outer
                // loop checks the stop flag before reconnecting.
                StreamStep::Closed | StreamStep::Checkpoint => return Ok(()),
            };
            if self.stop.load(Ordering::Acquire) {
                return Ok(());
            }
            if let Some(id) = event.id {
                self.last_event_id = Some(id);
            }

            let event_type = event.event_type.as_deref().unwrap_or("message");
            if event_type != "message" {
                log::debug!(target: "appflags", event_type; "ignoring update stream event");
                continue;
            }
            match parse_update_event(&event.data) {
                Ok(published) => {
                    // The reload worker exiting means the client is shutting
                    // down.
                    if self.publish_sender.send(published).is_err() {
                        return Ok(());
                    }
                }
                Err(err) => {
                    log::warn!(target: "appflags", "error handling configuration update event: {:?}", err);
                }
            }
        }
    }

    fn discover_stream_url(&self) -> Result<String> {
        let url = Url::parse(&format!(
            "{}/realtimeToken/{}/eventSource",
            self.edge_url, self.environment_id
        ))
        .map_err(Error::InvalidBaseUrl)?;

        let response: GetStreamUrlResponse = self
            .discovery_client
            .get(url)
            .send()?
            .error_for_status()?
            .json()?;
        Ok(response.url)
    }
}

/// One read off the stream: an event, an orderly close, or the idle
/// checkpoint from the read timeout.
enum StreamStep {
    Event(SseEvent),
    Closed,
    Checkpoint,
}

fn next_step(reader: &mut impl BufRead) -> Result<StreamStep> {
    match read_event(reader) {
        Ok(Some(event)) => Ok(StreamStep::Event(event)),
        Ok(None) => Ok(StreamStep::Closed),
        Err(err) if is_read_timeout(&err) => Ok(StreamStep::Checkpoint),
        Err(err) => Err(err.into()),
    }
}

/// Whether a stream read failure is the checkpoint timeout rather than a
/// broken connection. The HTTP client wraps its timeout error, so the inner
/// error is inspected as well as the kind.
fn is_read_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    ) || err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
        .is_some_and(reqwest::Error::is_timeout)
}

/// Decode the doubly-nested update payload into the publish timestamp.
fn parse_update_event(data: &str) -> Result<f64> {
    let message: EventSourceMessage = serde_json::from_str(data)?;
    let event: ConfigurationUpdateEvent = serde_json::from_str(&message.data)?;
    Ok(event.published)
}

/// Build the stream URL, attaching the resume cursor when one exists.
fn resume_url(stream_url: &str, last_event_id: Option<&str>) -> Result<Url> {
    let mut url = Url::parse(stream_url).map_err(Error::InvalidBaseUrl)?;
    if let Some(id) = last_event_id {
        url.query_pairs_mut().append_pair("lastEvent", id);
    }
    Ok(url)
}

/// A single server-sent event.
#[derive(Debug, PartialEq, Default)]
struct SseEvent {
    id: Option<String>,
    /// `None` means the default type, "message".
    event_type: Option<String>,
    data: String,
}

/// Read the next event off the stream. Returns `None` when the stream ends.
///
/// Implements the subset of the SSE wire format the edge emits: `id`,
/// `event` and `data` fields, comment lines, blank-line dispatch, and
/// multi-line data joined with newlines.
fn read_event(reader: &mut impl BufRead) -> std::io::Result<Option<SseEvent>> {
    let mut event = SseEvent::default();
    let mut seen_field = false;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            // Stream ended; a partially-read event is dropped.
            return Ok(None);
        }
        let line = line.trim_end_matches(['\r', '\n']);

        if line.is_empty() {
            if seen_field {
                return Ok(Some(event));
            }
            // Keep-alive blank line.
            continue;
        }
        if line.starts_with(':') {
            // Comment line.
            continue;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => {
                event.id = Some(value.to_owned());
                seen_field = true;
            }
            "event" => {
                event.event_type = Some(value.to_owned());
                seen_field = true;
            }
            "data" => {
                if !event.data.is_empty() {
                    event.data.push('\n');
                }
                event.data.push_str(value);
                seen_field = true;
            }
            _ => {
                // Unknown fields are ignored per the SSE spec.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor};

    use super::{next_step, parse_update_event, read_event, resume_url, StreamStep};

    /// A stream whose every read fails with the given error kind.
    struct FailingReader(io::ErrorKind);

    impl io::Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(self.0.into())
        }
    }

    impl io::BufRead for FailingReader {
        fn fill_buf(&mut self) -> io::Result<&[u8]> {
            Err(self.0.into())
        }
        fn consume(&mut self, _amt: usize) {}
    }

    fn events(stream: &str) -> Vec<super::SseEvent> {
        let mut reader = Cursor::new(stream);
        let mut events = Vec::new();
        while let Some(event) = read_event(&mut reader).unwrap() {
            events.push(event);
        }
        events
    }

    #[test]
    fn parses_id_event_and_data_fields() {
        let events = events("id: 42\nevent: message\ndata: {\"published\": 1.5}\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_deref(), Some("42"));
        assert_eq!(events[0].event_type.as_deref(), Some("message"));
        assert_eq!(events[0].data, "{\"published\": 1.5}");
    }

    #[test]
    fn event_type_defaults_to_message() {
        let events = events("data: hello\n\n");

        assert_eq!(events[0].event_type, None);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn multi_line_data_is_joined_with_newlines() {
        let events = events("data: first\ndata: second\n\n");

        assert_eq!(events[0].data, "first\nsecond");
    }

    #[test]
    fn comments_and_keep_alive_lines_are_skipped() {
        let events = events(": keep-alive\n\n: another\nid: 1\ndata: x\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_deref(), Some("1"));
    }

    #[test]
    fn reads_consecutive_events() {
        let events = events("id: 1\ndata: a\n\nid: 2\ndata: b\n\n");

        assert_eq!(events.len(), 2);
        assert_eq!(events[1].id.as_deref(), Some("2"));
        assert_eq!(events[1].data, "b");
    }

    #[test]
    fn partial_event_at_stream_end_is_dropped() {
        let events = events("id: 1\ndata: unterminated");

        assert!(events.is_empty());
    }

    #[test]
    fn handles_crlf_line_endings() {
        let events = events("id: 7\r\ndata: x\r\n\r\n");

        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn read_timeout_is_a_checkpoint_not_a_failure() {
        assert!(matches!(
            next_step(&mut FailingReader(io::ErrorKind::TimedOut)).unwrap(),
            StreamStep::Checkpoint
        ));
        assert!(matches!(
            next_step(&mut FailingReader(io::ErrorKind::WouldBlock)).unwrap(),
            StreamStep::Checkpoint
        ));
    }

    #[test]
    fn other_read_errors_still_fail_the_stream() {
        assert!(next_step(&mut FailingReader(io::ErrorKind::ConnectionReset)).is_err());
    }

    #[test]
    fn stream_end_is_an_orderly_close() {
        assert!(matches!(
            next_step(&mut Cursor::new("")).unwrap(),
            StreamStep::Closed
        ));
    }

    #[test]
    fn resume_url_without_cursor_has_no_last_event() {
        let url = resume_url("https://stream.example/sse?token=abc", None).unwrap();

        assert!(!url.as_str().contains("lastEvent"));
    }

    #[test]
    fn resume_url_carries_cursor_and_existing_params() {
        let url = resume_url("https://stream.example/sse?token=abc", Some("evt-9")).unwrap();

        assert_eq!(
            url.as_str(),
            "https://stream.example/sse?token=abc&lastEvent=evt-9"
        );
    }

    #[test]
    fn update_event_payload_is_doubly_nested_json() {
        let published =
            parse_update_event(r#"{"data": "{\"published\": 150.0}"}"#).unwrap();

        assert_eq!(published, 150.0);
    }

    #[test]
    fn malformed_update_event_is_an_error() {
        assert!(parse_update_event("not json").is_err());
        assert!(parse_update_event(r#"{"data": "not json"}"#).is_err());
    }
}

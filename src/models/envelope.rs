use lapin::types::{AMQPValue, FieldTable, ShortString};

pub const ATTEMPT_HEADER: &str = "x-attempt";
pub const FIRST_SEEN_HEADER: &str = "x-first-seen";
pub const ORIGINAL_ROUTING_HEADER: &str = "x-original-routing";
pub const DELAY_HEADER: &str = "x-delay";
pub const LAST_ERROR_HEADER: &str = "x-last-error";
pub const LAST_FAILED_AT_HEADER: &str = "x-last-failed-at";

const OWNED_HEADERS: [&str; 6] = [
    ATTEMPT_HEADER,
    FIRST_SEEN_HEADER,
    ORIGINAL_ROUTING_HEADER,
    DELAY_HEADER,
    LAST_ERROR_HEADER,
    LAST_FAILED_AT_HEADER,
];

/// Broker headers owned by the dispatch core. Anything else found on a
/// delivery is kept in `passthrough` and written back untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub attempt: u32,
    pub first_seen_ms: i64,
    pub original_routing: String,
    pub delay_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_failed_at_ms: Option<i64>,
    pub passthrough: FieldTable,
}

impl Envelope {
    pub fn new(original_routing: impl Into<String>, first_seen_ms: i64) -> Self {
        Self {
            attempt: 0,
            first_seen_ms,
            original_routing: original_routing.into(),
            delay_ms: None,
            last_error: None,
            last_failed_at_ms: None,
            passthrough: FieldTable::default(),
        }
    }

    pub fn with_delay(mut self, delay_ms: Option<u64>) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Reads the envelope off a delivery. Missing or unreadable headers fall
    /// back to a first-delivery envelope routed at `fallback_routing`.
    pub fn from_headers(headers: Option<&FieldTable>, fallback_routing: &str, now_ms: i64) -> Self {
        let mut envelope = Self::new(fallback_routing, now_ms);

        let Some(headers) = headers else {
            return envelope;
        };

        for (key, value) in headers.inner() {
            match key.as_str() {
                ATTEMPT_HEADER => {
                    if let Some(attempt) = as_i64(value).and_then(|v| u32::try_from(v).ok()) {
                        envelope.attempt = attempt;
                    }
                }
                FIRST_SEEN_HEADER => {
                    if let Some(first_seen) = as_i64(value) {
                        envelope.first_seen_ms = first_seen;
                    }
                }
                ORIGINAL_ROUTING_HEADER => {
                    if let Some(routing) = as_string(value) {
                        envelope.original_routing = routing;
                    }
                }
                DELAY_HEADER => {
                    envelope.delay_ms = as_i64(value).and_then(|v| u64::try_from(v).ok());
                }
                LAST_ERROR_HEADER => envelope.last_error = as_string(value),
                LAST_FAILED_AT_HEADER => envelope.last_failed_at_ms = as_i64(value),
                _ => {
                    envelope.passthrough.insert(key.clone(), value.clone());
                }
            }
        }

        envelope
    }

    pub fn to_headers(&self) -> FieldTable {
        let mut headers = FieldTable::default();

        for (key, value) in self.passthrough.inner() {
            if !OWNED_HEADERS.contains(&key.as_str()) {
                headers.insert(key.clone(), value.clone());
            }
        }

        headers.insert(
            ATTEMPT_HEADER.into(),
            AMQPValue::LongLongInt(i64::from(self.attempt)),
        );
        headers.insert(
            FIRST_SEEN_HEADER.into(),
            AMQPValue::LongLongInt(self.first_seen_ms),
        );
        headers.insert(
            ORIGINAL_ROUTING_HEADER.into(),
            AMQPValue::LongString(self.original_routing.as_str().into()),
        );

        if let Some(delay) = self.delay_ms {
            headers.insert(
                DELAY_HEADER.into(),
                AMQPValue::LongLongInt(i64::try_from(delay).unwrap_or(i64::MAX)),
            );
        }

        if let Some(error) = &self.last_error {
            headers.insert(
                LAST_ERROR_HEADER.into(),
                AMQPValue::LongString(error.as_str().into()),
            );
        }

        if let Some(failed_at) = self.last_failed_at_ms {
            headers.insert(
                LAST_FAILED_AT_HEADER.into(),
                AMQPValue::LongLongInt(failed_at),
            );
        }

        headers
    }

    /// Envelope for the republish that follows a failed attempt. The attempt
    /// counter only ever moves here, never on receive.
    pub fn after_failure(&self, error: &str, now_ms: i64) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            last_error: Some(error.to_string()),
            last_failed_at_ms: Some(now_ms),
            ..self.clone()
        }
    }

    pub fn header(&self, key: &str) -> Option<&AMQPValue> {
        self.passthrough.inner().get(&ShortString::from(key))
    }
}

fn as_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::Timestamp(v) => i64::try_from(*v).ok(),
        AMQPValue::ShortString(s) => s.as_str().parse().ok(),
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok()?.parse().ok(),
        _ => None,
    }
}

fn as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        _ => None,
    }
}

//! Parsing of asynchronous trigger frames.
//!
//! While the trigger listener is running, the probe pushes ASCII text lines
//! of the form:
//!
//! ```text
//! G <TAG> <timestamp> <value> <count> ...
//! ```
//!
//! where `<TAG>` is a single uppercase letter, the numeric fields are decimal
//! digits, and anything after the fourth field is ignored.

use crate::error::{Error, Result};

/// An asynchronous event notification from the probe, parsed into a
/// structured record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerMessage {
    /// Single-letter event tag identifying the trigger source.
    pub tag: char,
    /// Event timestamp in probe clock units (microseconds).
    pub timestamp: i64,
    /// Event payload value (e.g. a sensor reading or edge direction).
    pub value: i32,
    /// Running event counter maintained by the firmware.
    pub sequence_count: u32,
}

impl TriggerMessage {
    /// Parses the portion of a trigger frame after the leading `G` marker.
    ///
    /// Expects at least four whitespace-separated fields: tag, timestamp,
    /// value and sequence count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TriggerParse`] if fewer than four fields are present
    /// or a numeric field is not a valid integer.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        if parts.len() < 4 {
            return Err(Error::TriggerParse {
                frame: s.to_owned(),
                reason: format!("expected 4 fields, got {}", parts.len()),
            });
        }

        let tag = parts[0].chars().next().ok_or_else(|| Error::TriggerParse {
            frame: s.to_owned(),
            reason: "empty tag field".into(),
        })?;

        let timestamp = parse_field(parts[1], "timestamp", s)?;
        let value = parse_field(parts[2], "value", s)?;
        let sequence_count = parse_field(parts[3], "sequence count", s)?;

        Ok(Self {
            tag,
            timestamp,
            value,
            sequence_count,
        })
    }
}

fn parse_field<T: std::str::FromStr>(field: &str, name: &str, frame: &str) -> Result<T> {
    field.parse().map_err(|_| Error::TriggerParse {
        frame: frame.to_owned(),
        reason: format!("invalid {name} {field:?}"),
    })
}

/// Returns true if the raw frame is a trigger frame.
///
/// A trigger frame is the literal marker `G`, whitespace, one uppercase
/// letter, whitespace, digits, whitespace, digits, then arbitrary trailing
/// content.
#[must_use]
pub fn is_trigger_frame(s: &str) -> bool {
    let mut fields = s.trim().split_whitespace();

    let Some(marker) = fields.next() else {
        return false;
    };
    if marker != "G" {
        return false;
    }

    let Some(tag) = fields.next() else {
        return false;
    };
    let mut tag_chars = tag.chars();
    if !(tag_chars.next().is_some_and(|c| c.is_ascii_uppercase()) && tag_chars.next().is_none()) {
        return false;
    }

    // Two numeric fields must follow. The first must be all digits (it is
    // delimited by whitespace); the second only needs to start with a digit
    // run, since anything after it counts as trailing content. A frame like
    // "G T 12345 7x" is therefore classified as a trigger and rejected at
    // field parsing instead.
    let Some(num) = fields.next() else {
        return false;
    };
    if num.is_empty() || !num.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }

    let Some(num) = fields.next() else {
        return false;
    };
    num.chars().next().is_some_and(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trigger_message() {
        let msg = TriggerMessage::parse("T 12345 7 1").unwrap();
        assert_eq!(msg.tag, 'T');
        assert_eq!(msg.timestamp, 12345);
        assert_eq!(msg.value, 7);
        assert_eq!(msg.sequence_count, 1);
    }

    #[test]
    fn test_parse_ignores_trailing_fields() {
        let msg = TriggerMessage::parse("L 998877 0 42 extra stuff").unwrap();
        assert_eq!(msg.tag, 'L');
        assert_eq!(msg.sequence_count, 42);
    }

    #[test]
    fn test_parse_too_few_fields() {
        let err = TriggerMessage::parse("T 12345 7").unwrap_err();
        assert!(matches!(err, Error::TriggerParse { .. }));
    }

    #[test]
    fn test_parse_bad_number() {
        let err = TriggerMessage::parse("T abc 7 1").unwrap_err();
        assert!(matches!(err, Error::TriggerParse { .. }));
    }

    #[test]
    fn test_is_trigger_frame() {
        assert!(is_trigger_frame("G T 12345 7"));
        assert!(is_trigger_frame("  G T 12345 7 1 trailing  "));
        assert!(!is_trigger_frame("X T 12345 7"));
        // Tag must be a single uppercase letter.
        assert!(!is_trigger_frame("G t 12345 7"));
        assert!(!is_trigger_frame("G TT 12345 7"));
        assert!(!is_trigger_frame("G T 12x45 7"));
        assert!(!is_trigger_frame("G T 12345"));
        assert!(!is_trigger_frame(""));
    }

    #[test]
    fn test_trailing_junk_on_last_field_still_classifies() {
        // Classified as a trigger, then rejected during field parsing.
        assert!(is_trigger_frame("G T 12345 7x"));
        assert!(matches!(
            TriggerMessage::parse("T 12345 7x"),
            Err(Error::TriggerParse { .. })
        ));
        // But the field must still begin with a digit.
        assert!(!is_trigger_frame("G T 12345 x7"));
    }
}

//! Response classification
//!
//! The controller answers in free-form text lines with no request ids. These
//! helpers turn a collected reply into a structured outcome per operation.

/// Marker the firmware prints at the top of its status block
pub const STATUS_MARKER: &str = "STATUS";

/// Marker the firmware prints when a jog starts
pub const JOG_MARKER: &str = "JOGGING";

/// Outcome of a command that only needs acknowledging
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    /// The controller replied without an error
    Accepted(Vec<String>),
    /// The controller replied with an error line
    Rejected(String),
    /// Nothing arrived within the response window
    NoReply,
}

impl Ack {
    /// Check if the reply carried an error line
    pub fn is_rejected(&self) -> bool {
        matches!(self, Ack::Rejected(_))
    }
}

/// Whether a line reports an error
pub fn is_error_line(line: &str) -> bool {
    let upper = line.trim().to_ascii_uppercase();
    upper.starts_with("ERR") || upper.contains("INVALID") || upper.contains("UNKNOWN")
}

/// Classify a collected reply; any error line makes it a rejection
pub fn classify_ack(lines: &[String]) -> Ack {
    if lines.is_empty() {
        return Ack::NoReply;
    }
    match lines.iter().find(|line| is_error_line(line)) {
        Some(line) => Ack::Rejected(line.clone()),
        None => Ack::Accepted(lines.to_vec()),
    }
}

/// Parse a number from a line such as `12.5`, `POS: 12.5` or `Position=12.50 mm`
fn parse_number(line: &str) -> Option<f64> {
    let value = match line.rfind(&[':', '='][..]) {
        Some(idx) => &line[idx + 1..],
        None => line,
    };
    let value = value.trim();
    let value = value.strip_suffix("mm").unwrap_or(value).trim();
    value.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Position in mm from a `POS` reply: the first line that holds a number
pub fn parse_position(lines: &[String]) -> Option<f64> {
    lines.iter().find_map(|line| parse_number(line))
}

/// Whether a reply confirms a jog started
pub fn is_jogging(lines: &[String]) -> bool {
    lines.iter().any(|line| line.contains(JOG_MARKER))
}

/// Parsed reply to the `?` status query
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    /// Some line carried the status marker
    pub alive: bool,
    /// `key: value` / `key=value` pairs in the order received
    pub fields: Vec<(String, String)>,
    /// Raw reply
    pub lines: Vec<String>,
}

impl StatusReport {
    /// Parse a collected `?` reply; never fails
    pub fn parse(lines: &[String]) -> Self {
        let alive = lines.iter().any(|line| line.contains(STATUS_MARKER));
        let fields = lines
            .iter()
            .filter_map(|line| {
                let idx = line.find(&[':', '='][..])?;
                let key = line[..idx].trim();
                let value = line[idx + 1..].trim();
                if key.is_empty() || value.is_empty() {
                    return None;
                }
                Some((key.to_string(), value.to_string()))
            })
            .collect();

        Self {
            alive,
            fields,
            lines: lines.to_vec(),
        }
    }

    /// Field lookup, case-insensitive on the key
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Numeric field, accepting an `mm` or `mm/s` unit suffix
    pub fn numeric_field(&self, key: &str) -> Option<f64> {
        let value = self.field(key)?;
        let value = value
            .strip_suffix("mm/s")
            .or_else(|| value.strip_suffix("mm"))
            .unwrap_or(value)
            .trim();
        value.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_classify_ack() {
        assert_eq!(classify_ack(&[]), Ack::NoReply);
        assert_eq!(
            classify_ack(&lines(&["Feeding 100 mm"])),
            Ack::Accepted(lines(&["Feeding 100 mm"]))
        );
        assert_eq!(
            classify_ack(&lines(&["ERROR: distance too large"])),
            Ack::Rejected("ERROR: distance too large".to_string())
        );
        assert!(classify_ack(&lines(&["ok", "Unknown command: X"])).is_rejected());
    }

    #[test]
    fn test_parse_position_formats() {
        assert_eq!(parse_position(&lines(&["12.5"])), Some(12.5));
        assert_eq!(parse_position(&lines(&["POS: -3.25"])), Some(-3.25));
        assert_eq!(parse_position(&lines(&["Position=50.00 mm"])), Some(50.0));
        assert_eq!(parse_position(&lines(&["Position (mm): 7"])), Some(7.0));
        assert_eq!(parse_position(&lines(&["moving", "POS: 1"])), Some(1.0));
        assert_eq!(parse_position(&lines(&["no number here"])), None);
        assert_eq!(parse_position(&[]), None);
    }

    #[test]
    fn test_status_report() {
        let report = StatusReport::parse(&lines(&[
            "=== STATUS ===",
            "Position: 12.50 mm",
            "Speed: 10.00 mm/s",
            "Jogging=no",
        ]));
        assert!(report.alive);
        assert_eq!(report.fields.len(), 3);
        assert_eq!(report.field("jogging"), Some("no"));
        assert_eq!(report.numeric_field("Position"), Some(12.5));
        assert_eq!(report.numeric_field("speed"), Some(10.0));
    }

    #[test]
    fn test_status_without_marker_is_not_alive() {
        let report = StatusReport::parse(&lines(&["Tube Feeder v1.0"]));
        assert!(!report.alive);
        assert!(report.fields.is_empty());
    }

    #[test]
    fn test_is_jogging() {
        assert!(is_jogging(&lines(&["JOGGING FORWARD"])));
        assert!(!is_jogging(&lines(&["OK"])));
    }
}

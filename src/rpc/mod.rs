//! Long-lived bidirectional streaming over WebSocket text frames.
//!
//! One logical subscription per stream: the client sends
//! [`LinesRequest`]s to replace what it is subscribed to, the server pushes
//! one [`LinesResponse`] per emission tick. Both endpoints are driven by the
//! typed completion dispatcher in [`dispatch`].

pub mod client;
pub mod dispatch;
pub mod server;

pub use client::RpcClient;
pub use server::RpcServer;

use serde::{Deserialize, Serialize};

/// One subscription update: jointly replaces the stream's polling period and
/// sport set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinesRequest {
    /// Seconds between server pushes.
    pub polling_period: u64,
    pub sports: Vec<String>,
}

/// One emission tick's worth of scores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinesResponse {
    pub lines: Vec<Line>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub sport: String,
    pub score: f64,
}

/// Terminal status of one stream, carried by the finishing completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    Ok,
    Cancelled,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape_is_stable() {
        let req = LinesRequest {
            polling_period: 5,
            sports: vec!["football".to_string(), "baseball".to_string()],
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"polling_period": 5, "sports": ["football", "baseball"]})
        );
    }

    #[test]
    fn response_wire_shape_is_stable() {
        let resp = LinesResponse {
            lines: vec![Line {
                sport: "baseball".to_string(),
                score: 7.5,
            }],
        };
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"lines": [{"sport": "baseball", "score": 7.5}]})
        );
    }

    #[test]
    fn requests_compare_period_and_sports_jointly() {
        let base = LinesRequest {
            polling_period: 5,
            sports: vec!["football".to_string()],
        };
        let mut other = base.clone();
        assert_eq!(base, other);

        other.polling_period = 10;
        assert_ne!(base, other);

        other.polling_period = 5;
        other.sports.push("baseball".to_string());
        assert_ne!(base, other);
    }
}

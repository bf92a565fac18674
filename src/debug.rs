//! A write-only side channel for intermediate results.

use crate::math::Point2d;
use crate::speed::SpeedPoint;
#[cfg(feature = "debug")]
use serde_json::json;

/// Receives diagnostic records from the optimizer. Nothing recorded is ever read back.
pub trait DiagnosticSink {
    /// Records a speed profile.
    fn record_speed_profile(&mut self, name: &str, points: &[SpeedPoint]);

    /// Records a closed polygon on the ST graph.
    fn record_drivable_boundary(&mut self, name: &str, polygon: &[Point2d]);

    /// Records `(s, v)` speed limit samples.
    fn record_speed_limit(&mut self, points: &[(f64, f64)]);
}

/// Discards all records.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDiagnostics;

impl DiagnosticSink for NoDiagnostics {
    fn record_speed_profile(&mut self, _name: &str, _points: &[SpeedPoint]) {}

    fn record_drivable_boundary(&mut self, _name: &str, _polygon: &[Point2d]) {}

    fn record_speed_limit(&mut self, _points: &[(f64, f64)]) {}
}

/// A single diagnostic record.
#[derive(Clone, Debug, PartialEq)]
pub enum DebugRecord {
    SpeedProfile {
        name: String,
        points: Vec<SpeedPoint>,
    },
    DrivableBoundary {
        name: String,
        polygon: Vec<Point2d>,
    },
    SpeedLimit {
        points: Vec<(f64, f64)>,
    },
}

/// Keeps every record in order of arrival.
#[derive(Clone, Debug, Default)]
pub struct DiagnosticRecorder {
    records: Vec<DebugRecord>,
}

impl DiagnosticRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[DebugRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Finds the speed profile recorded under `name`.
    pub fn speed_profile(&self, name: &str) -> Option<&[SpeedPoint]> {
        self.records.iter().find_map(|record| match record {
            DebugRecord::SpeedProfile { name: n, points } if n == name => Some(points.as_slice()),
            _ => None,
        })
    }

    /// Takes all records, leaving the recorder empty.
    pub fn take(&mut self) -> Vec<DebugRecord> {
        std::mem::take(&mut self.records)
    }

    /// Exports the records as a JSON array.
    #[cfg(feature = "debug")]
    pub fn to_json(&self) -> serde_json::Value {
        let records: Vec<_> = self
            .records
            .iter()
            .map(|record| match record {
                DebugRecord::SpeedProfile { name, points } => json!({
                    "type": "speed_profile",
                    "name": name,
                    "points": points,
                }),
                DebugRecord::DrivableBoundary { name, polygon } => json!({
                    "type": "polygon",
                    "name": name,
                    "points": polygon.iter().map(|p| [p.x, p.y]).collect::<Vec<_>>(),
                }),
                DebugRecord::SpeedLimit { points } => json!({
                    "type": "speed_limit",
                    "points": points,
                }),
            })
            .collect();
        json!(records)
    }
}

impl DiagnosticSink for DiagnosticRecorder {
    fn record_speed_profile(&mut self, name: &str, points: &[SpeedPoint]) {
        self.records.push(DebugRecord::SpeedProfile {
            name: name.to_string(),
            points: points.to_vec(),
        });
    }

    fn record_drivable_boundary(&mut self, name: &str, polygon: &[Point2d]) {
        self.records.push(DebugRecord::DrivableBoundary {
            name: name.to_string(),
            polygon: polygon.to_vec(),
        });
    }

    fn record_speed_limit(&mut self, points: &[(f64, f64)]) {
        self.records.push(DebugRecord::SpeedLimit {
            points: points.to_vec(),
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn records_in_order() {
        let mut recorder = DiagnosticRecorder::new();
        recorder.record_speed_profile("qp_speed", &[SpeedPoint::new(0.0, 0.0, 1.0, 0.0, 0.0)]);
        recorder.record_speed_limit(&[(0.0, 10.0)]);
        assert_eq!(recorder.records().len(), 2);
        assert_eq!(recorder.speed_profile("qp_speed").map(|p| p.len()), Some(1));
        assert!(recorder.speed_profile("other").is_none());
        assert_eq!(recorder.take().len(), 2);
        assert!(recorder.is_empty());
    }

    #[cfg(feature = "debug")]
    #[test]
    fn exports_json() {
        let mut recorder = DiagnosticRecorder::new();
        recorder.record_drivable_boundary("ST_drive_Boundary", &[Point2d::new(0.0, 1.0)]);
        let json = recorder.to_json();
        assert_eq!(json[0]["name"], "ST_drive_Boundary");
        assert_eq!(json[0]["points"][0][1], 1.0);
    }
}

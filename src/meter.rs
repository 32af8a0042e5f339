use log::{debug, warn};
use std::collections::HashMap;
use thiserror::Error;

use crate::sensor::{Phase, Sensor, TOTAL_POWER_PATH};
use crate::service::ValueSink;

/// Payload Home Assistant sends while an entity has no valid state.
pub const UNAVAILABLE: &str = "unavailable";

#[derive(Debug, Error)]
pub enum MeterError {
    #[error("payload for {sensor} is not valid UTF-8")]
    Encoding { sensor: Sensor },

    #[error("payload for {sensor} is not a number: {payload:?}")]
    Malformed { sensor: Sensor, payload: String },
}

/// Latest reading per sensor. A sensor missing from the map has not been
/// seen since start.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MeterState {
    readings: HashMap<Sensor, f64>,
}

impl MeterState {
    pub fn get(&self, sensor: Sensor) -> Option<f64> {
        self.readings.get(&sensor).copied()
    }

    fn set(&mut self, sensor: Sensor, value: f64) {
        self.readings.insert(sensor, value);
    }

    /// Grid power balance in watts; import and export arrive in kW.
    /// `None` until both are known, or if the balance overflows.
    pub fn total_power(&self) -> Option<f64> {
        let import = self.get(Sensor::GridImport)?;
        let export = self.get(Sensor::GridExport)?;
        Some(1000.0 * (import - export)).filter(|p| p.is_finite())
    }

    /// Current times voltage of one phase.
    pub fn apparent_power(&self, phase: Phase) -> Option<f64> {
        Some(self.get(phase.current())? * self.get(phase.voltage())?)
    }

    /// Share of total active power attributed to `phase`, weighted by each
    /// phase's apparent power. `None` when any input is missing, the
    /// apparent power of all phases sums to zero, or the result is not finite.
    pub fn phase_power(&self, phase: Phase) -> Option<f64> {
        let total = self.total_power()?;
        let mut sum = 0.0;
        for p in Phase::ALL {
            sum += self.apparent_power(p)?;
        }
        if sum == 0.0 {
            return None;
        }
        Some(total / sum * self.apparent_power(phase)?).filter(|p| p.is_finite())
    }

    fn has_grid_power(&self) -> bool {
        self.get(Sensor::GridImport).is_some() && self.get(Sensor::GridExport).is_some()
    }
}

/// Aggregates individual sensor updates into meter values and pushes them to
/// a sink, skipping values identical to the last one sent for a path.
pub struct Meter<S> {
    state: MeterState,
    published: HashMap<&'static str, f64>,
    sink: S,
}

impl<S: ValueSink> Meter<S> {
    pub fn new(sink: S) -> Self {
        Self {
            state: MeterState::default(),
            published: HashMap::new(),
            sink,
        }
    }

    pub fn reading(&self, sensor: Sensor) -> Option<f64> {
        self.state.get(sensor)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Apply one raw payload for `sensor`.
    ///
    /// `unavailable` leaves the stored reading untouched. Anything else that
    /// does not parse as a finite number is returned as an error; missing
    /// inputs for derived values are only logged.
    pub fn update(&mut self, sensor: Sensor, payload: &[u8]) -> Result<(), MeterError> {
        let Some(value) = parse_payload(sensor, payload)? else {
            warn!("Unavailable entity found for {}. Skipping.", sensor);
            return Ok(());
        };

        self.state.set(sensor, value);

        if let Some(output) = sensor.output() {
            self.publish_if_changed(output.path, value);
        }

        match self.state.total_power() {
            Some(total) => {
                self.publish_if_changed(TOTAL_POWER_PATH, total);
            }
            None if self.state.has_grid_power() => warn!(
                "Total power skipped after {} update: grid import/export balance is not finite",
                sensor
            ),
            None => warn!(
                "Total power skipped after {} update: grid import/export not received yet",
                sensor
            ),
        }

        if let Some(phase) = sensor.phase() {
            self.update_phase_power(phase);
        }

        Ok(())
    }

    fn update_phase_power(&mut self, phase: Phase) {
        match self.state.phase_power(phase) {
            Some(power) => {
                self.publish_if_changed(phase.power_path(), power);
            }
            None if self.phase_inputs_complete() => warn!(
                "{} power skipped: apparent power sum is zero or the result is not finite",
                phase
            ),
            None => warn!(
                "{} power skipped: not all phase currents, voltages and grid power received yet",
                phase
            ),
        }
    }

    fn phase_inputs_complete(&self) -> bool {
        self.state.has_grid_power()
            && Phase::ALL
                .iter()
                .all(|p| self.state.apparent_power(*p).is_some())
    }

    /// Send `value` to `path` unless it is bit-identical to the last value
    /// sent there. Returns whether the sink was written.
    pub fn publish_if_changed(&mut self, path: &'static str, value: f64) -> bool {
        if let Some(previous) = self.published.get(path) {
            if previous.to_bits() == value.to_bits() {
                debug!("{} unchanged at {}", path, value);
                return false;
            }
        }
        self.sink.publish(path, value);
        self.published.insert(path, value);
        true
    }
}

/// `Ok(None)` for the unavailable sentinel.
fn parse_payload(sensor: Sensor, payload: &[u8]) -> Result<Option<f64>, MeterError> {
    let text = std::str::from_utf8(payload).map_err(|_| MeterError::Encoding { sensor })?;
    let text = text.trim();
    if text == UNAVAILABLE {
        return Ok(None);
    }
    match text.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(Some(value)),
        _ => Err(MeterError::Malformed {
            sensor,
            payload: text.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recorder {
        writes: Vec<(String, f64)>,
    }

    impl ValueSink for Recorder {
        fn publish(&mut self, path: &str, value: f64) {
            self.writes.push((path.to_string(), value));
        }
    }

    impl Recorder {
        fn for_path(&self, path: &str) -> Vec<f64> {
            self.writes
                .iter()
                .filter(|(p, _)| p == path)
                .map(|(_, v)| *v)
                .collect()
        }
    }

    fn meter() -> Meter<Recorder> {
        Meter::new(Recorder::default())
    }

    fn feed(meter: &mut Meter<Recorder>, updates: &[(Sensor, &str)]) {
        for (sensor, payload) in updates {
            meter.update(*sensor, payload.as_bytes()).unwrap();
        }
    }

    fn all_phases(current: &'static str, voltage: &'static str) -> Vec<(Sensor, &'static str)> {
        Phase::ALL
            .iter()
            .flat_map(|p| [(p.current(), current), (p.voltage(), voltage)])
            .collect()
    }

    #[test]
    fn total_power_from_grid_balance() {
        let mut m = meter();
        feed(&mut m, &[(Sensor::GridImport, "10.0"), (Sensor::GridExport, "2.0")]);
        assert_eq!(m.sink().for_path(TOTAL_POWER_PATH), vec![8000.0]);
        assert_eq!(m.published.get(TOTAL_POWER_PATH), Some(&8000.0));
    }

    #[test]
    fn total_power_negative_when_exporting() {
        let mut m = meter();
        feed(&mut m, &[(Sensor::GridImport, "0.5"), (Sensor::GridExport, "3")]);
        assert_eq!(m.sink().for_path(TOTAL_POWER_PATH), vec![-2500.0]);
    }

    #[test]
    fn repeated_balance_is_suppressed() {
        let mut m = meter();
        feed(&mut m, &[(Sensor::GridImport, "10.0"), (Sensor::GridExport, "2.0")]);
        let before = m.sink().writes.len();
        feed(&mut m, &[(Sensor::GridImport, "10.0"), (Sensor::GridExport, "2.0")]);
        assert_eq!(m.sink().writes.len(), before);
        assert_eq!(m.sink().for_path(TOTAL_POWER_PATH), vec![8000.0]);
    }

    #[test]
    fn phase_power_distributed_by_apparent_power() {
        let mut m = meter();
        feed(&mut m, &[(Sensor::GridImport, "10.0"), (Sensor::GridExport, "2.0")]);
        feed(&mut m, &all_phases("10.0", "230.0"));

        let mut sum = 0.0;
        for phase in Phase::ALL {
            let written = m.sink().for_path(phase.power_path());
            assert_eq!(written.len(), 1, "{} written once", phase);
            assert!((written[0] - 8000.0 / 3.0).abs() < 0.01);
            sum += written[0];
        }
        assert!((sum - 8000.0).abs() < 0.001);
    }

    #[test]
    fn phase_power_weighted_by_load() {
        let mut m = meter();
        feed(
            &mut m,
            &[
                (Sensor::GridImport, "6.9"),
                (Sensor::GridExport, "0"),
                (Sensor::Current(Phase::L1), "20"),
                (Sensor::Voltage(Phase::L1), "230"),
                (Sensor::Current(Phase::L2), "10"),
                (Sensor::Voltage(Phase::L2), "230"),
                (Sensor::Current(Phase::L3), "0"),
                (Sensor::Voltage(Phase::L3), "230"),
            ],
        );
        let l1 = m.state.phase_power(Phase::L1).unwrap();
        let l2 = m.state.phase_power(Phase::L2).unwrap();
        let l3 = m.state.phase_power(Phase::L3).unwrap();
        assert!((l1 - 4600.0).abs() < 0.001);
        assert!((l2 - 2300.0).abs() < 0.001);
        assert_eq!(l3, 0.0);
        assert!((l1 + l2 + l3 - 6900.0).abs() < 0.001);
    }

    #[test]
    fn phase_sum_tracks_latest_total() {
        let mut m = meter();
        feed(&mut m, &all_phases("4.2", "229.5"));
        feed(
            &mut m,
            &[
                (Sensor::GridImport, "3.3"),
                (Sensor::GridExport, "0.1"),
                (Sensor::Current(Phase::L2), "7.5"),
                (Sensor::GridImport, "1.0"),
            ],
        );
        let total = m.state.total_power().unwrap();
        let sum: f64 = Phase::ALL
            .iter()
            .map(|p| m.state.phase_power(*p).unwrap())
            .sum();
        assert!((sum - total).abs() < 1e-6);
    }

    #[test]
    fn only_updated_phase_is_derived() {
        let mut m = meter();
        feed(&mut m, &[(Sensor::GridImport, "10.0"), (Sensor::GridExport, "2.0")]);
        feed(&mut m, &all_phases("10.0", "230.0"));
        let l1_before = m.sink().for_path(Phase::L1.power_path()).len();
        let l3_before = m.sink().for_path(Phase::L3.power_path()).len();

        feed(&mut m, &[(Sensor::Current(Phase::L1), "20.0")]);

        assert_eq!(m.sink().for_path(Phase::L1.power_path()).len(), l1_before + 1);
        assert_eq!(m.sink().for_path(Phase::L3.power_path()).len(), l3_before);
    }

    #[test]
    fn zero_currents_publish_no_phase_power() {
        let mut m = meter();
        feed(&mut m, &[(Sensor::GridImport, "1.0"), (Sensor::GridExport, "0.0")]);
        feed(&mut m, &all_phases("0", "230"));
        for phase in Phase::ALL {
            assert!(m.sink().for_path(phase.power_path()).is_empty());
            assert_eq!(m.state.phase_power(phase), None);
        }
        assert_eq!(m.sink().for_path(TOTAL_POWER_PATH), vec![1000.0]);
    }

    #[test]
    fn overflowing_values_are_not_published() {
        let mut m = meter();
        feed(&mut m, &[(Sensor::GridImport, "1e306"), (Sensor::GridExport, "0")]);
        assert_eq!(m.state.total_power(), None);
        assert!(m.sink().for_path(TOTAL_POWER_PATH).is_empty());

        feed(&mut m, &[(Sensor::GridImport, "1.0")]);
        feed(&mut m, &all_phases("1e200", "1e200"));
        assert_eq!(m.sink().for_path(TOTAL_POWER_PATH), vec![1000.0]);
        for phase in Phase::ALL {
            assert_eq!(m.state.phase_power(phase), None);
            assert!(m.sink().for_path(phase.power_path()).is_empty());
        }
        assert!(m.sink().writes.iter().all(|(_, v)| v.is_finite()));

        // recovers once the inputs are sane again
        feed(&mut m, &all_phases("10.0", "230.0"));
        let l3 = m.sink().for_path(Phase::L3.power_path());
        assert!((l3[l3.len() - 1] - 1000.0 / 3.0).abs() < 0.001);
        assert!(m.sink().writes.iter().all(|(_, v)| v.is_finite()));
    }

    #[test]
    fn missing_export_skips_derivations() {
        let mut m = meter();
        feed(&mut m, &[(Sensor::GridImport, "10.0")]);
        feed(&mut m, &all_phases("10.0", "230.0"));

        assert!(m.sink().for_path(TOTAL_POWER_PATH).is_empty());
        for phase in Phase::ALL {
            assert!(m.sink().for_path(phase.power_path()).is_empty());
        }
        // pass-through still happens
        assert_eq!(m.sink().for_path("/Ac/L2/Voltage"), vec![230.0]);
    }

    #[test]
    fn missing_phase_skips_phase_power() {
        let mut m = meter();
        feed(
            &mut m,
            &[
                (Sensor::GridImport, "10.0"),
                (Sensor::GridExport, "2.0"),
                (Sensor::Current(Phase::L1), "10.0"),
                (Sensor::Voltage(Phase::L1), "230.0"),
            ],
        );
        assert!(m.sink().for_path(Phase::L1.power_path()).is_empty());
    }

    #[test]
    fn passthrough_forwards_raw_value() {
        let mut m = meter();
        feed(
            &mut m,
            &[
                (Sensor::EnergyForward, "1234.5"),
                (Sensor::EnergyReverse, "987.25"),
                (Sensor::Current(Phase::L3), " 3.75\n"),
            ],
        );
        assert_eq!(m.sink().for_path("/Ac/Energy/Forward"), vec![1234.5]);
        assert_eq!(m.sink().for_path("/Ac/Energy/Reverse"), vec![987.25]);
        assert_eq!(m.sink().for_path("/Ac/L3/Current"), vec![3.75]);
    }

    #[test]
    fn grid_power_is_not_forwarded() {
        let mut m = meter();
        feed(&mut m, &[(Sensor::GridImport, "1.5")]);
        assert!(m.sink().writes.is_empty());
        assert_eq!(m.reading(Sensor::GridImport), Some(1.5));
    }

    #[test]
    fn unavailable_keeps_prior_reading() {
        let mut m = meter();
        feed(&mut m, &[(Sensor::Current(Phase::L1), "12.5")]);
        let writes = m.sink().writes.len();

        feed(&mut m, &[(Sensor::Current(Phase::L1), "unavailable")]);

        assert_eq!(m.reading(Sensor::Current(Phase::L1)), Some(12.5));
        assert_eq!(m.sink().writes.len(), writes);
    }

    #[test]
    fn unavailable_before_any_value() {
        let mut m = meter();
        feed(&mut m, &[(Sensor::EnergyForward, "unavailable")]);
        assert_eq!(m.reading(Sensor::EnergyForward), None);
        assert!(m.sink().writes.is_empty());
    }

    #[test]
    fn last_write_wins() {
        let mut m = meter();
        feed(
            &mut m,
            &[
                (Sensor::Voltage(Phase::L2), "229.0"),
                (Sensor::GridExport, "0.3"),
                (Sensor::Voltage(Phase::L2), "231.5"),
                (Sensor::Voltage(Phase::L2), "unavailable"),
                (Sensor::GridExport, "0.0"),
            ],
        );
        assert_eq!(m.reading(Sensor::Voltage(Phase::L2)), Some(231.5));
        assert_eq!(m.reading(Sensor::GridExport), Some(0.0));
        assert_eq!(m.reading(Sensor::GridImport), None);
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let mut m = meter();
        feed(&mut m, &[(Sensor::Current(Phase::L1), "4.0")]);

        let err = m
            .update(Sensor::Current(Phase::L1), b"unknown")
            .unwrap_err();
        assert!(matches!(
            err,
            MeterError::Malformed { sensor: Sensor::Current(Phase::L1), ref payload } if payload == "unknown"
        ));
        assert_eq!(m.reading(Sensor::Current(Phase::L1)), Some(4.0));
    }

    #[test]
    fn non_finite_payload_rejected() {
        let mut m = meter();
        assert!(m.update(Sensor::GridImport, b"nan").is_err());
        assert!(m.update(Sensor::GridImport, b"inf").is_err());
        assert_eq!(m.reading(Sensor::GridImport), None);
    }

    #[test]
    fn invalid_utf8_rejected() {
        let mut m = meter();
        let err = m.update(Sensor::EnergyReverse, &[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, MeterError::Encoding { sensor: Sensor::EnergyReverse }));
    }

    #[test]
    fn publish_if_changed_compares_bits() {
        let mut m = meter();
        assert!(m.publish_if_changed(TOTAL_POWER_PATH, 0.0));
        assert!(!m.publish_if_changed(TOTAL_POWER_PATH, 0.0));
        assert!(m.publish_if_changed(TOTAL_POWER_PATH, -0.0));
        assert!(m.publish_if_changed(TOTAL_POWER_PATH, 1e-12));
        assert!(m.publish_if_changed("/Ac/L1/Power", 1e-12));
        assert_eq!(m.sink().writes.len(), 4);
    }

    #[test]
    fn independent_meters() {
        let mut a = meter();
        let b = meter();
        feed(&mut a, &[(Sensor::GridImport, "1.0")]);
        assert_eq!(a.reading(Sensor::GridImport), Some(1.0));
        assert_eq!(b.reading(Sensor::GridImport), None);
    }
}

use std::fmt;

/// Suffix Home Assistant appends to every entity state topic.
pub const STATE_SUFFIX: &str = "/state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    L1,
    L2,
    L3,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];

    pub fn number(self) -> u8 {
        match self {
            Phase::L1 => 1,
            Phase::L2 => 2,
            Phase::L3 => 3,
        }
    }

    pub fn current(self) -> Sensor {
        Sensor::Current(self)
    }

    pub fn voltage(self) -> Sensor {
        Sensor::Voltage(self)
    }

    /// Output path of the derived active power for this phase.
    pub fn power_path(self) -> &'static str {
        match self {
            Phase::L1 => "/Ac/L1/Power",
            Phase::L2 => "/Ac/L2/Power",
            Phase::L3 => "/Ac/L3/Power",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.number())
    }
}

/// Display unit of a published path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    KiloWattHours,
    Amperes,
    Volts,
    Watts,
}

impl Unit {
    pub fn format(self, value: f64) -> String {
        match self {
            Unit::KiloWattHours => format!("{:.0}kWh", value),
            Unit::Amperes => format!("{:.1}A", value),
            Unit::Volts => format!("{:.1}V", value),
            Unit::Watts => format!("{:.0}W", value),
        }
    }
}

/// Where a sensor's raw value is forwarded on the device service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Output {
    pub path: &'static str,
    pub unit: Unit,
}

/// Every measurement the bridge listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Sensor {
    /// Cumulative imported energy (kWh).
    EnergyForward,
    /// Cumulative exported energy (kWh).
    EnergyReverse,
    /// Instantaneous power drawn from the grid (kW).
    GridImport,
    /// Instantaneous power fed into the grid (kW).
    GridExport,
    Current(Phase),
    Voltage(Phase),
}

struct SensorEntry {
    sensor: Sensor,
    key: &'static str,
    output: Option<Output>,
}

const fn passthrough(path: &'static str, unit: Unit) -> Option<Output> {
    Some(Output { path, unit })
}

// Key and pass-through mapping for the whole sensor universe.
static SENSOR_TABLE: [SensorEntry; 10] = [
    SensorEntry {
        sensor: Sensor::EnergyForward,
        key: "zahlerstand_bezug",
        output: passthrough("/Ac/Energy/Forward", Unit::KiloWattHours),
    },
    SensorEntry {
        sensor: Sensor::EnergyReverse,
        key: "zahlerstand_einspeisung",
        output: passthrough("/Ac/Energy/Reverse", Unit::KiloWattHours),
    },
    SensorEntry {
        sensor: Sensor::GridImport,
        key: "netz_bezug",
        output: None,
    },
    SensorEntry {
        sensor: Sensor::GridExport,
        key: "netz_einspeisung",
        output: None,
    },
    SensorEntry {
        sensor: Sensor::Current(Phase::L1),
        key: "netz_i1",
        output: passthrough("/Ac/L1/Current", Unit::Amperes),
    },
    SensorEntry {
        sensor: Sensor::Voltage(Phase::L1),
        key: "netz_u1",
        output: passthrough("/Ac/L1/Voltage", Unit::Volts),
    },
    SensorEntry {
        sensor: Sensor::Current(Phase::L2),
        key: "netz_i2",
        output: passthrough("/Ac/L2/Current", Unit::Amperes),
    },
    SensorEntry {
        sensor: Sensor::Voltage(Phase::L2),
        key: "netz_u2",
        output: passthrough("/Ac/L2/Voltage", Unit::Volts),
    },
    SensorEntry {
        sensor: Sensor::Current(Phase::L3),
        key: "netz_i3",
        output: passthrough("/Ac/L3/Current", Unit::Amperes),
    },
    SensorEntry {
        sensor: Sensor::Voltage(Phase::L3),
        key: "netz_u3",
        output: passthrough("/Ac/L3/Voltage", Unit::Volts),
    },
];

/// Output path of the derived total active power.
pub const TOTAL_POWER_PATH: &str = "/Ac/Power";

impl Sensor {
    pub const ALL: [Sensor; 10] = [
        Sensor::EnergyForward,
        Sensor::EnergyReverse,
        Sensor::GridImport,
        Sensor::GridExport,
        Sensor::Current(Phase::L1),
        Sensor::Voltage(Phase::L1),
        Sensor::Current(Phase::L2),
        Sensor::Voltage(Phase::L2),
        Sensor::Current(Phase::L3),
        Sensor::Voltage(Phase::L3),
    ];

    // Position in SENSOR_TABLE.
    fn index(self) -> usize {
        match self {
            Sensor::EnergyForward => 0,
            Sensor::EnergyReverse => 1,
            Sensor::GridImport => 2,
            Sensor::GridExport => 3,
            Sensor::Current(p) => 2 + 2 * p.number() as usize,
            Sensor::Voltage(p) => 3 + 2 * p.number() as usize,
        }
    }

    fn entry(self) -> &'static SensorEntry {
        &SENSOR_TABLE[self.index()]
    }

    /// Home Assistant entity name, e.g. `netz_i1`.
    pub fn key(self) -> &'static str {
        self.entry().key
    }

    pub fn from_key(key: &str) -> Option<Sensor> {
        SENSOR_TABLE.iter().find(|e| e.key == key).map(|e| e.sensor)
    }

    /// Raw value forwarding target, if the sensor is a pass-through quantity.
    pub fn output(self) -> Option<Output> {
        self.entry().output
    }

    /// The phase a current or voltage sensor belongs to.
    pub fn phase(self) -> Option<Phase> {
        match self {
            Sensor::Current(p) | Sensor::Voltage(p) => Some(p),
            _ => None,
        }
    }

    /// State topic for this sensor below `prefix`, e.g. `hass/sensor/netz_i1/state`.
    pub fn topic(self, prefix: &str) -> String {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            format!("{}{}", self.key(), STATE_SUFFIX)
        } else {
            format!("{}/{}{}", prefix, self.key(), STATE_SUFFIX)
        }
    }

    /// Reverse of [`Sensor::topic`]. Returns `None` for anything outside the
    /// known universe.
    pub fn from_topic(prefix: &str, topic: &str) -> Option<Sensor> {
        let prefix = prefix.trim_end_matches('/');
        let rest = if prefix.is_empty() {
            topic
        } else {
            topic.strip_prefix(prefix)?.strip_prefix('/')?
        };
        Sensor::from_key(rest.strip_suffix(STATE_SUFFIX)?)
    }
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Every output path with its unit, pass-through and derived alike.
pub fn measurement_paths() -> Vec<Output> {
    let mut paths: Vec<Output> = Sensor::ALL.iter().filter_map(|s| s.output()).collect();
    paths.extend(Phase::ALL.iter().map(|p| Output {
        path: p.power_path(),
        unit: Unit::Watts,
    }));
    paths.push(Output {
        path: TOTAL_POWER_PATH,
        unit: Unit::Watts,
    });
    paths
}

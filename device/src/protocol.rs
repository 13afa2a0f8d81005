//! Controller text protocol
//!
//! Every operation maps to a request template and an optional reply
//! pattern. Templates use `{name}` placeholders; patterns are regular
//! expressions whose first capture group (or whole match) is the value.
//! A site can override any entry through configuration.

use crate::error::{DeviceError, DeviceResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Liveness probe sent before retrying a failed command
pub const PROBE_COMMAND: &str = "echo its alive";
/// Expected probe reply
pub const PROBE_REPLY: &str = "its alive";

/// Operations understood by the telescope controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    OpenDome,
    CloseDome,
    KeepOpen,
    DomeStatus,
    EnableTracking,
    DisableTracking,
    Cloud,
    Dew,
    Rain,
    SunAltitude,
    MoonAltitude,
    Goto,
    GotoHaDec,
    AltAz,
    Offset,
    CurrentFilter,
    ChangeFilter,
    Expose,
    Dark,
    Lock,
    Unlock,
    LockStatus,
    GetFocus,
    SetFocus,
    HomeDome,
    HomeHa,
    HomeDec,
    LampsOn,
    LampsOff,
    ChipTemperature,
    ChipSetpoint,
    CoolCcd,
    MakeDir,
    MeanCount,
    SolveField,
}

impl Operation {
    pub const ALL: [Operation; 35] = [
        Operation::OpenDome,
        Operation::CloseDome,
        Operation::KeepOpen,
        Operation::DomeStatus,
        Operation::EnableTracking,
        Operation::DisableTracking,
        Operation::Cloud,
        Operation::Dew,
        Operation::Rain,
        Operation::SunAltitude,
        Operation::MoonAltitude,
        Operation::Goto,
        Operation::GotoHaDec,
        Operation::AltAz,
        Operation::Offset,
        Operation::CurrentFilter,
        Operation::ChangeFilter,
        Operation::Expose,
        Operation::Dark,
        Operation::Lock,
        Operation::Unlock,
        Operation::LockStatus,
        Operation::GetFocus,
        Operation::SetFocus,
        Operation::HomeDome,
        Operation::HomeHa,
        Operation::HomeDec,
        Operation::LampsOn,
        Operation::LampsOff,
        Operation::ChipTemperature,
        Operation::ChipSetpoint,
        Operation::CoolCcd,
        Operation::MakeDir,
        Operation::MeanCount,
        Operation::SolveField,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Operation::OpenDome => "open dome",
            Operation::CloseDome => "close dome",
            Operation::KeepOpen => "keep open",
            Operation::DomeStatus => "dome status",
            Operation::EnableTracking => "enable tracking",
            Operation::DisableTracking => "disable tracking",
            Operation::Cloud => "cloud cover",
            Operation::Dew => "dew",
            Operation::Rain => "rain",
            Operation::SunAltitude => "sun altitude",
            Operation::MoonAltitude => "moon altitude",
            Operation::Goto => "goto",
            Operation::GotoHaDec => "goto ha/dec",
            Operation::AltAz => "altaz",
            Operation::Offset => "offset",
            Operation::CurrentFilter => "current filter",
            Operation::ChangeFilter => "change filter",
            Operation::Expose => "exposure",
            Operation::Dark => "dark",
            Operation::Lock => "lock",
            Operation::Unlock => "unlock",
            Operation::LockStatus => "lock status",
            Operation::GetFocus => "get focus",
            Operation::SetFocus => "set focus",
            Operation::HomeDome => "home dome",
            Operation::HomeHa => "home ha",
            Operation::HomeDec => "home dec",
            Operation::LampsOn => "lamps on",
            Operation::LampsOff => "lamps off",
            Operation::ChipTemperature => "chip temperature",
            Operation::ChipSetpoint => "chip setpoint",
            Operation::CoolCcd => "cool ccd",
            Operation::MakeDir => "make dir",
            Operation::MeanCount => "mean count",
            Operation::SolveField => "solve field",
        }
    }
}

/// Request template and reply pattern for one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSpec {
    pub request: String,
    #[serde(default)]
    pub reply: Option<String>,
}

impl OperationSpec {
    fn new(request: &str, reply: Option<&str>) -> Self {
        Self {
            request: request.to_string(),
            reply: reply.map(str::to_string),
        }
    }
}

/// A controller dialect: the full operation table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dialect {
    pub operations: BTreeMap<Operation, OperationSpec>,
}

const NUMBER: &str = r"([-+]?[0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?)";

impl Default for Dialect {
    fn default() -> Self {
        use Operation::*;

        let number = |key: &str| format!("{}={}", key, NUMBER);
        let cloud = number("cloud");
        let dew = number("dew");
        let rain = number("rain");
        let alt = number("alt");
        let pos = number("pos");
        let tchip = number("tchip");
        let setpoint = number("setpoint");
        let mean = number("mean");

        let entries = [
            (OpenDome, OperationSpec::new("openup nocloud", None)),
            (CloseDome, OperationSpec::new("closedown", None)),
            (KeepOpen, OperationSpec::new("keepopen maxtime={time} slit", None)),
            (DomeStatus, OperationSpec::new("tx slit", Some(r"slit=(\S+)"))),
            (EnableTracking, OperationSpec::new("tx track on", None)),
            (DisableTracking, OperationSpec::new("tx track off", None)),
            (Cloud, OperationSpec::new("tx taux", Some(cloud.as_str()))),
            (Dew, OperationSpec::new("tx taux", Some(dew.as_str()))),
            (Rain, OperationSpec::new("tx taux", Some(rain.as_str()))),
            (SunAltitude, OperationSpec::new("sun", Some(alt.as_str()))),
            (MoonAltitude, OperationSpec::new("moon", Some(alt.as_str()))),
            (
                Goto,
                OperationSpec::new("tx point ra={ra} dec={dec} equinox=2000", None),
            ),
            (GotoHaDec, OperationSpec::new("tx point ha={ha} dec={dec}", None)),
            (AltAz, OperationSpec::new("echo {ra} {dec} 2000 | altaz", Some(alt.as_str()))),
            (Offset, OperationSpec::new("tx offset ra={ra} dec={dec}", None)),
            (CurrentFilter, OperationSpec::new("pfilter", Some(r"(\S+)"))),
            (ChangeFilter, OperationSpec::new("pfilter {name}", None)),
            (
                Expose,
                OperationSpec::new("image time={time} bin={binning} outfile={outfile}", None),
            ),
            (
                Dark,
                OperationSpec::new(
                    "image time={time} bin={binning} outfile={outfile} dark",
                    None,
                ),
            ),
            (
                Lock,
                OperationSpec::new("tx lock user={user} comment={comment}", Some("done lock")),
            ),
            (Unlock, OperationSpec::new("tx lock clear", Some("done lock"))),
            (LockStatus, OperationSpec::new("tx lock", Some(r"user=(\S+)"))),
            (GetFocus, OperationSpec::new("tx focus", Some(pos.as_str()))),
            (SetFocus, OperationSpec::new("tx focus pos={position}", Some("done focus"))),
            (HomeDome, OperationSpec::new("tx home dome", Some("done home"))),
            (HomeHa, OperationSpec::new("tx home ha", Some("done home"))),
            (HomeDec, OperationSpec::new("tx home dec", Some("done home"))),
            (LampsOn, OperationSpec::new("tx lamps on", Some("done lamps"))),
            (LampsOff, OperationSpec::new("tx lamps off", Some("done lamps"))),
            (ChipTemperature, OperationSpec::new("ccd status", Some(tchip.as_str()))),
            (ChipSetpoint, OperationSpec::new("ccd status", Some(setpoint.as_str()))),
            (CoolCcd, OperationSpec::new("ccd cool", None)),
            (MakeDir, OperationSpec::new("mkdir -p {path}", None)),
            (MeanCount, OperationSpec::new("imstat {path}", Some(mean.as_str()))),
            (
                SolveField,
                OperationSpec::new(
                    "solve-field {path} --ra {ra} --dec {dec} --radius {radius} \
                     --scale-low {scale_low} --scale-high {scale_high} --scale-units arcsecperpix \
                     --downsample {downsample} --cpulimit {cpu_limit} --overwrite --no-plots",
                    Some(r"Field center: \(RA,Dec\) = \(([0-9.\-\s]+),([0-9.\-\s]+)\) deg\."),
                ),
            ),
        ];

        Self {
            operations: entries.into_iter().collect(),
        }
    }
}

impl Dialect {
    /// Override a single operation
    pub fn with(mut self, operation: Operation, request: &str, reply: Option<&str>) -> Self {
        self.operations
            .insert(operation, OperationSpec::new(request, reply));
        self
    }
}

/// Substitute `{name}` placeholders in a request template
pub fn render(template: &str, args: &[(&str, String)]) -> String {
    args.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{}}}", key), value)
    })
}

struct CompiledOperation {
    request: String,
    reply: Option<Regex>,
}

/// A compiled dialect, ready to format requests and parse replies
pub struct CommandTable {
    entries: HashMap<Operation, CompiledOperation>,
}

impl CommandTable {
    /// Compile a dialect. Operations the dialect leaves out use the default dialect.
    pub fn new(dialect: &Dialect) -> DeviceResult<Self> {
        let defaults = Dialect::default();
        let mut entries = HashMap::with_capacity(Operation::ALL.len());

        for operation in Operation::ALL {
            let Some(spec) = dialect
                .operations
                .get(&operation)
                .or_else(|| defaults.operations.get(&operation))
            else {
                continue;
            };

            let reply = match spec.reply.as_deref() {
                Some(pattern) if !pattern.is_empty() => {
                    Some(Regex::new(pattern).map_err(|e| DeviceError::InvalidPattern {
                        operation: operation.name().to_string(),
                        message: e.to_string(),
                    })?)
                }
                _ => None,
            };

            entries.insert(
                operation,
                CompiledOperation {
                    request: spec.request.clone(),
                    reply,
                },
            );
        }

        Ok(Self { entries })
    }

    fn entry(&self, operation: Operation) -> DeviceResult<&CompiledOperation> {
        self.entries
            .get(&operation)
            .ok_or_else(|| DeviceError::InvalidPattern {
                operation: operation.name().to_string(),
                message: "operation missing from dialect".to_string(),
            })
    }

    /// Format the request for an operation
    pub fn request(&self, operation: Operation, args: &[(&str, String)]) -> DeviceResult<String> {
        Ok(render(&self.entry(operation)?.request, args))
    }

    /// Whether the reply carries the operation's success marker.
    /// Operations without a reply pattern always match.
    pub fn matches(&self, operation: Operation, reply: &str) -> bool {
        match self.entries.get(&operation).and_then(|e| e.reply.as_ref()) {
            Some(pattern) => pattern.is_match(reply),
            None => true,
        }
    }

    /// All capture groups of the reply pattern (or the whole match when
    /// the pattern has no groups)
    pub fn captures(&self, operation: Operation, reply: &str) -> DeviceResult<Vec<String>> {
        let entry = self.entry(operation)?;
        let Some(pattern) = entry.reply.as_ref() else {
            return Ok(vec![reply.trim().to_string()]);
        };

        let caps = pattern
            .captures(reply)
            .ok_or_else(|| DeviceError::parse(operation.name(), pattern.as_str(), reply))?;

        if caps.len() == 1 {
            return Ok(vec![caps[0].trim().to_string()]);
        }

        Ok(caps
            .iter()
            .skip(1)
            .map(|m| m.map(|m| m.as_str().trim().to_string()).unwrap_or_default())
            .collect())
    }

    /// First captured value of the reply
    pub fn capture(&self, operation: Operation, reply: &str) -> DeviceResult<String> {
        self.captures(operation, reply)?
            .into_iter()
            .next()
            .ok_or_else(|| DeviceError::parse(operation.name(), "", reply))
    }

    /// First captured value of the reply, as a number
    pub fn number(&self, operation: Operation, reply: &str) -> DeviceResult<f64> {
        let value = self.capture(operation, reply)?;
        value
            .parse::<f64>()
            .map_err(|_| DeviceError::parse(operation.name(), "<number>", reply))
    }
}

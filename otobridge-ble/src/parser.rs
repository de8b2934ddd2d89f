//! Advertisement decoding.
//!
//! Turns a [`RawAdvertisement`] into a validated [`TankReading`]. Decoding is
//! pure: no I/O, no shared state, and the same advertisement always decodes
//! to the same result.
//!
//! The broadcast format is hardware specific, so decoding sits behind the
//! [`AdvertisementGrammar`] trait. Two grammars are provided:
//!
//! - [`NameTokenGrammar`]: key/value tokens in the friendly name,
//!   e.g. `OTO sn:A1B2C3 lvl:73 bat:91 t:21.5`
//! - [`OtodataGrammar`]: serial from manufacturer data (company `0x03B1`),
//!   level from a `level:` token in the friendly name
//!
//! Numeric fields are range checked and never clamped.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use otobridge_common::{RawAdvertisement, TankReading};

/// Otodata's Bluetooth SIG company identifier.
pub const OTODATA_COMPANY_ID: u16 = 0x03B1;

/// Marker at the start of Otodata manufacturer data.
pub const OTODATA_MAGIC: &[u8] = b"OTO";

/// Default friendly-name prefix for the token grammar.
pub const DEFAULT_NAME_PREFIX: &str = "OTO";

const LEVEL_RANGE: (f64, f64) = (0.0, 100.0);
const BATTERY_RANGE: (f64, f64) = (0.0, 100.0);
const TEMPERATURE_RANGE: (f64, f64) = (-40.0, 85.0);

static SERIAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,32}$").expect("valid serial regex"));

// Values are the leading number only; units or trailing text are dropped.
static LEVEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\blevel\s*[:=]\s*([+-]?\d+(?:\.\d+)?)").expect("valid level regex")
});

static BATTERY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bbat(?:t|tery)?\s*[:=]\s*([+-]?\d+(?:\.\d+)?)")
        .expect("valid battery regex")
});

static TEMPERATURE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:t|temp|temperature)\s*[:=]\s*([+-]?\d+(?:\.\d+)?)")
        .expect("valid temperature regex")
});

/// Why an advertisement was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    /// Not a tank advertisement, or not in a form we understand.
    #[error("unrecognized format: {0}")]
    UnrecognizedFormat(String),

    /// No serial in an otherwise recognized advertisement.
    #[error("missing serial")]
    MissingSerial,

    /// Serial present but unusable as an identity.
    #[error("invalid serial '{0}'")]
    InvalidSerial(String),

    /// No level in an otherwise recognized advertisement.
    #[error("missing level")]
    MissingLevel,

    /// A numeric field did not hold a finite number.
    #[error("invalid number for {field}: '{value}'")]
    InvalidNumber { field: &'static str, value: String },

    /// A numeric field is outside its physical range.
    #[error("{field} out of range: {value}")]
    FieldOutOfRange { field: &'static str, value: f64 },
}

impl ParseError {
    /// Stable reason code for logs and counters.
    pub fn reason(&self) -> &'static str {
        match self {
            ParseError::UnrecognizedFormat(_) => "unrecognized-format",
            ParseError::MissingSerial => "missing-serial",
            ParseError::InvalidSerial(_) => "invalid-serial",
            ParseError::MissingLevel => "missing-level",
            ParseError::InvalidNumber { .. } => "invalid-number",
            ParseError::FieldOutOfRange { .. } => "field-out-of-range",
        }
    }
}

/// A broadcast format that can be decoded into a [`TankReading`].
pub trait AdvertisementGrammar: Send + Sync {
    /// Grammar name for logs.
    fn name(&self) -> &'static str;

    /// Decode one advertisement.
    fn parse(&self, advert: &RawAdvertisement) -> Result<TankReading, ParseError>;
}

/// Selects the grammar in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GrammarKind {
    /// Key/value tokens in the friendly name.
    #[default]
    NameTokens,
    /// Otodata manufacturer data plus `level:` in the friendly name.
    Otodata,
}

impl GrammarKind {
    /// Build the grammar.
    pub fn build(&self, name_prefix: &str) -> Box<dyn AdvertisementGrammar> {
        match self {
            GrammarKind::NameTokens => Box::new(NameTokenGrammar::new(name_prefix)),
            GrammarKind::Otodata => Box::new(OtodataGrammar),
        }
    }
}

/// Raw field text collected from an advertisement, before validation.
#[derive(Debug, Default)]
struct Fields<'a> {
    serial: Option<String>,
    level: Option<&'a str>,
    battery: Option<&'a str>,
    temperature: Option<&'a str>,
}

impl Fields<'_> {
    fn into_reading(self, advert: &RawAdvertisement) -> Result<TankReading, ParseError> {
        let serial = self.serial.ok_or(ParseError::MissingSerial)?;
        if !SERIAL_RE.is_match(&serial) {
            return Err(ParseError::InvalidSerial(serial));
        }

        let level = self.level.ok_or(ParseError::MissingLevel)?;
        let level = percent("level", level, LEVEL_RANGE)?;

        let mut reading = TankReading::new(serial, level)
            .with_rssi(advert.rssi)
            .with_raw_name(advert.local_name.clone().unwrap_or_default());

        if let Some(battery) = self.battery {
            reading = reading.with_battery(percent("battery", battery, BATTERY_RANGE)?);
        }
        if let Some(temperature) = self.temperature {
            reading =
                reading.with_temperature(number("temperature", temperature, TEMPERATURE_RANGE)?);
        }

        Ok(reading)
    }
}

fn number(field: &'static str, text: &str, (min, max): (f64, f64)) -> Result<f64, ParseError> {
    let value: f64 = text
        .trim()
        .parse()
        .ok()
        .filter(|v: &f64| v.is_finite())
        .ok_or_else(|| ParseError::InvalidNumber {
            field,
            value: text.to_string(),
        })?;

    if value < min || value > max {
        return Err(ParseError::FieldOutOfRange { field, value });
    }
    Ok(value)
}

fn percent(field: &'static str, text: &str, range: (f64, f64)) -> Result<u8, ParseError> {
    // In range means 0..=100, so the rounded value fits.
    Ok(number(field, text, range)?.round() as u8)
}

/// Key/value tokens in the advertised friendly name.
///
/// The name must start with the configured prefix. The remainder is split on
/// whitespace, `,` and `;` into `key:value` or `key=value` tokens; a key with
/// an empty value takes the next token (`level: 73`) unless that token is
/// itself a `key:value` pair, in which case the key is treated as absent.
/// Keys are case-insensitive:
///
/// | Field | Keys |
/// |---|---|
/// | serial | `sn`, `serial` |
/// | level | `lvl`, `level` |
/// | battery | `bat`, `batt`, `battery` |
/// | temperature | `t`, `temp`, `temperature` |
///
/// Unknown keys are skipped. A repeated key makes the whole name ambiguous
/// and is rejected.
#[derive(Debug, Clone)]
pub struct NameTokenGrammar {
    prefix: String,
}

impl NameTokenGrammar {
    /// Create a grammar accepting names that start with `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for NameTokenGrammar {
    fn default() -> Self {
        Self::new(DEFAULT_NAME_PREFIX)
    }
}

impl AdvertisementGrammar for NameTokenGrammar {
    fn name(&self) -> &'static str {
        "name-tokens"
    }

    fn parse(&self, advert: &RawAdvertisement) -> Result<TankReading, ParseError> {
        let name = advert
            .local_name
            .as_deref()
            .ok_or_else(|| ParseError::UnrecognizedFormat("no local name".to_string()))?;

        let body = name.strip_prefix(self.prefix.as_str()).ok_or_else(|| {
            ParseError::UnrecognizedFormat(format!("name does not start with '{}'", self.prefix))
        })?;

        let mut fields = Fields::default();
        let mut tokens = body
            .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
            .filter(|t| !t.is_empty())
            .peekable();

        while let Some(token) = tokens.next() {
            let Some((key, value)) = token.split_once([':', '=']) else {
                continue;
            };
            let value = if value.is_empty() {
                // A following `key:value` token is not this key's value.
                match tokens.next_if(|next| !next.contains([':', '='])) {
                    Some(next) => next,
                    None => continue,
                }
            } else {
                value
            };

            let duplicate = match key.to_ascii_lowercase().as_str() {
                "sn" | "serial" => fields.serial.replace(value.to_string()).is_some(),
                "lvl" | "level" => fields.level.replace(value).is_some(),
                "bat" | "batt" | "battery" => fields.battery.replace(value).is_some(),
                "t" | "temp" | "temperature" => fields.temperature.replace(value).is_some(),
                _ => false,
            };
            if duplicate {
                return Err(ParseError::UnrecognizedFormat(format!(
                    "repeated key '{}'",
                    key
                )));
            }
        }

        fields.into_reading(advert)
    }
}

/// Otodata TM6030 style advertisements.
///
/// The serial is a little-endian `u32` at bytes 7..11 of the manufacturer
/// data for company `0x03B1`, which starts with `OTO`. Level, and optionally
/// battery and temperature, come from `key:value` text in the friendly name.
#[derive(Debug, Clone, Copy, Default)]
pub struct OtodataGrammar;

impl OtodataGrammar {
    fn serial(data: &[u8]) -> Result<String, ParseError> {
        if !data.starts_with(OTODATA_MAGIC) {
            return Err(ParseError::UnrecognizedFormat(
                "manufacturer data does not start with 'OTO'".to_string(),
            ));
        }
        let bytes: [u8; 4] = data
            .get(7..11)
            .and_then(|b| b.try_into().ok())
            .ok_or(ParseError::MissingSerial)?;
        Ok(u32::from_le_bytes(bytes).to_string())
    }
}

impl AdvertisementGrammar for OtodataGrammar {
    fn name(&self) -> &'static str {
        "otodata"
    }

    fn parse(&self, advert: &RawAdvertisement) -> Result<TankReading, ParseError> {
        let data = advert
            .manufacturer_data
            .get(&OTODATA_COMPANY_ID)
            .ok_or_else(|| {
                ParseError::UnrecognizedFormat("no Otodata manufacturer data".to_string())
            })?;

        let serial = Self::serial(data)?;
        let name = advert.local_name.as_deref().unwrap_or_default();
        let capture = |re: &Regex| {
            re.captures(name)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str())
        };

        Fields {
            serial: Some(serial),
            level: capture(&LEVEL_RE),
            battery: capture(&BATTERY_RE),
            temperature: capture(&TEMPERATURE_RE),
        }
        .into_reading(advert)
    }
}

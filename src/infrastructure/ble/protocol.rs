//! Bodynodes GATT profile
//!
//! One service per node. `player` and `bodypart` are readable UTF-8
//! characteristics, every sensor type has its own notify characteristic.
//! Multi-byte numbers are big-endian.

use crate::domain::models::{
    SENSORTYPE_ACCELERATION_REL_TAG, SENSORTYPE_ANGULARVELOCITY_REL_TAG, SENSORTYPE_GLOVE_TAG,
    SENSORTYPE_ORIENTATION_ABS_TAG, SENSORTYPE_SHOE_TAG,
};
use crate::domain::settings::BleSettings;
use crate::error::{Error, Result};
use serde_json::{json, Value};

pub const GLOVE_PAYLOAD_LEN: usize = 9;

/// Notify characteristics to subscribe to, as (uuid, sensortype)
pub fn data_characteristics(settings: &BleSettings) -> Vec<(String, &'static str)> {
    vec![
        (
            settings.orientation_abs_char_uuid.to_lowercase(),
            SENSORTYPE_ORIENTATION_ABS_TAG,
        ),
        (
            settings.acceleration_rel_char_uuid.to_lowercase(),
            SENSORTYPE_ACCELERATION_REL_TAG,
        ),
        (
            settings.angularvelocity_rel_char_uuid.to_lowercase(),
            SENSORTYPE_ANGULARVELOCITY_REL_TAG,
        ),
        (settings.glove_char_uuid.to_lowercase(), SENSORTYPE_GLOVE_TAG),
        (settings.shoe_char_uuid.to_lowercase(), SENSORTYPE_SHOE_TAG),
    ]
}

fn read_floats(sensortype: &str, bytes: &[u8], count: usize) -> Result<Value> {
    if bytes.len() < count * 4 {
        return Err(Error::Malformed(format!(
            "{}: expected {} bytes, got {}",
            sensortype,
            count * 4,
            bytes.len()
        )));
    }
    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .take(count)
        .map(|c| f32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(json!(values))
}

/// Translate one notification payload into the JSON sensor value
pub fn decode_characteristic(sensortype: &str, bytes: &[u8]) -> Result<Value> {
    match sensortype {
        SENSORTYPE_ORIENTATION_ABS_TAG => read_floats(sensortype, bytes, 4),
        SENSORTYPE_ACCELERATION_REL_TAG | SENSORTYPE_ANGULARVELOCITY_REL_TAG => {
            read_floats(sensortype, bytes, 3)
        }
        SENSORTYPE_GLOVE_TAG => {
            if bytes.len() < GLOVE_PAYLOAD_LEN {
                return Err(Error::Malformed(format!(
                    "glove: expected {} bytes, got {}",
                    GLOVE_PAYLOAD_LEN,
                    bytes.len()
                )));
            }
            Ok(json!(&bytes[..GLOVE_PAYLOAD_LEN]))
        }
        SENSORTYPE_SHOE_TAG => match bytes.first() {
            Some(step) => Ok(json!([step])),
            None => Err(Error::Malformed("shoe: empty payload".to_string())),
        },
        other => Err(Error::Malformed(format!("unknown sensor type {}", other))),
    }
}

/// `player` / `bodypart` characteristics hold NUL padded UTF-8
pub fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}

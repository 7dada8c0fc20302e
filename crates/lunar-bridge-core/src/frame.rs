//! Binary telemetry frames from the datagram feed.
//!
//! Frame format: `[start marker][frame type][payload]`
//!
//! Only the telemetry frame type is decoded into fields. Every other frame
//! type is handed back untouched as [`Frame::Other`].

use serde::{Deserialize, Serialize};

/// First byte of every frame.
pub const FRAME_START_MARKER: u8 = 0x12;

/// Frame-type tag of a telemetry frame.
pub const TELEMETRY_FRAME_TYPE: u8 = 0x06;

/// Size of a telemetry payload in bytes.
pub const TELEMETRY_PAYLOAD_SIZE: usize = 63;

/// Marker + type byte.
pub const ENVELOPE_SIZE: usize = 2;

/// A decoded datagram frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A telemetry frame.
    Telemetry(TelemetryRecord),
    /// Any other frame type, not interpreted by this codec.
    Other { frame_type: u8, payload: Vec<u8> },
}

/// One decoded telemetry frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub icm_gyr_x: i16,
    pub icm_gyr_y: i16,
    pub icm_gyr_z: i16,
    pub icm_acc_x: i16,
    pub icm_acc_y: i16,
    pub icm_acc_z: i16,
    pub icm_temp: i16,
    pub mmc_mag_x: i32,
    pub mmc_mag_y: i32,
    pub mmc_mag_z: i32,
    pub mmc_temp: i16,
    pub rdn_serial_dose: u32,
    pub rdn_sen1_dose: u32,
    pub rdn_sen2_dose: u32,
    pub rdn_serial_intensity: u32,
    pub rdn_sen1_intensity: u32,
    pub rdn_sen2_intensity: u32,
    pub rdn_temp: i16,
    pub rdn_vdd: i16,
    pub rdn_crystal_ok: bool,
    pub rdn_analog_ok: bool,
    pub encoder_sensor: u8,
    pub hall_endstop: u8,
    pub reflective_endstop: u8,
    pub light_sensor: u16,
}

/// Error decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: needed {needed} bytes, got {got}")]
    MalformedFrame { needed: usize, got: usize },
    #[error("unknown start marker 0x{0:02x}")]
    UnknownStartMarker(u8),
}

/// Decode one datagram.
pub fn decode(raw: &[u8]) -> Result<Frame, DecodeError> {
    if raw.len() < ENVELOPE_SIZE {
        return Err(DecodeError::MalformedFrame {
            needed: ENVELOPE_SIZE,
            got: raw.len(),
        });
    }
    if raw[0] != FRAME_START_MARKER {
        return Err(DecodeError::UnknownStartMarker(raw[0]));
    }

    let frame_type = raw[1];
    let payload = &raw[ENVELOPE_SIZE..];
    if frame_type != TELEMETRY_FRAME_TYPE {
        return Ok(Frame::Other {
            frame_type,
            payload: payload.to_vec(),
        });
    }

    TelemetryRecord::from_payload(payload).map(Frame::Telemetry)
}

/// Encode a record as a complete telemetry frame.
pub fn encode(record: &TelemetryRecord) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ENVELOPE_SIZE + TELEMETRY_PAYLOAD_SIZE);
    frame.push(FRAME_START_MARKER);
    frame.push(TELEMETRY_FRAME_TYPE);
    frame.extend_from_slice(&record.to_payload());
    frame
}

impl TelemetryRecord {
    /// Decode a bare telemetry payload. Bytes past the payload are ignored.
    pub fn from_payload(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.len() < TELEMETRY_PAYLOAD_SIZE {
            return Err(DecodeError::MalformedFrame {
                needed: ENVELOPE_SIZE + TELEMETRY_PAYLOAD_SIZE,
                got: ENVELOPE_SIZE + payload.len(),
            });
        }

        let mut r = FieldReader::new(payload);
        Ok(Self {
            icm_gyr_x: r.i16()?,
            icm_gyr_y: r.i16()?,
            icm_gyr_z: r.i16()?,
            icm_acc_x: r.i16()?,
            icm_acc_y: r.i16()?,
            icm_acc_z: r.i16()?,
            icm_temp: r.i16()?,
            mmc_mag_x: r.i32()?,
            mmc_mag_y: r.i32()?,
            mmc_mag_z: r.i32()?,
            mmc_temp: r.i16()?,
            rdn_serial_dose: r.u32()?,
            rdn_sen1_dose: r.u32()?,
            rdn_sen2_dose: r.u32()?,
            rdn_serial_intensity: r.u32()?,
            rdn_sen1_intensity: r.u32()?,
            rdn_sen2_intensity: r.u32()?,
            rdn_temp: r.i16()?,
            rdn_vdd: r.i16()?,
            rdn_crystal_ok: r.u8()? != 0,
            rdn_analog_ok: r.u8()? != 0,
            encoder_sensor: r.u8()?,
            hall_endstop: r.u8()?,
            reflective_endstop: r.u8()?,
            light_sensor: r.u16()?,
        })
    }

    /// Encode the record as a bare payload, in the same layout `from_payload` reads.
    pub fn to_payload(&self) -> [u8; TELEMETRY_PAYLOAD_SIZE] {
        let mut w = FieldWriter::default();
        w.put(&self.icm_gyr_x.to_le_bytes());
        w.put(&self.icm_gyr_y.to_le_bytes());
        w.put(&self.icm_gyr_z.to_le_bytes());
        w.put(&self.icm_acc_x.to_le_bytes());
        w.put(&self.icm_acc_y.to_le_bytes());
        w.put(&self.icm_acc_z.to_le_bytes());
        w.put(&self.icm_temp.to_le_bytes());
        w.put(&self.mmc_mag_x.to_le_bytes());
        w.put(&self.mmc_mag_y.to_le_bytes());
        w.put(&self.mmc_mag_z.to_le_bytes());
        w.put(&self.mmc_temp.to_le_bytes());
        w.put(&self.rdn_serial_dose.to_le_bytes());
        w.put(&self.rdn_sen1_dose.to_le_bytes());
        w.put(&self.rdn_sen2_dose.to_le_bytes());
        w.put(&self.rdn_serial_intensity.to_le_bytes());
        w.put(&self.rdn_sen1_intensity.to_le_bytes());
        w.put(&self.rdn_sen2_intensity.to_le_bytes());
        w.put(&self.rdn_temp.to_le_bytes());
        w.put(&self.rdn_vdd.to_le_bytes());
        w.put(&[u8::from(self.rdn_crystal_ok), u8::from(self.rdn_analog_ok)]);
        w.put(&[self.encoder_sensor, self.hall_endstop, self.reflective_endstop]);
        w.put(&self.light_sensor.to_le_bytes());
        w.buf
    }
}

/// Sequential little-endian reader. Every read is bounds-checked.
struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let end = self.pos + N;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or(DecodeError::MalformedFrame {
                needed: ENVELOPE_SIZE + end,
                got: ENVELOPE_SIZE + self.buf.len(),
            })?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        self.take().map(u16::from_le_bytes)
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        self.take().map(i16::from_le_bytes)
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        self.take().map(i32::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        self.take().map(u32::from_le_bytes)
    }
}

struct FieldWriter {
    buf: [u8; TELEMETRY_PAYLOAD_SIZE],
    pos: usize,
}

impl Default for FieldWriter {
    fn default() -> Self {
        Self {
            buf: [0; TELEMETRY_PAYLOAD_SIZE],
            pos: 0,
        }
    }
}

impl FieldWriter {
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TelemetryRecord {
        TelemetryRecord {
            icm_gyr_x: -12,
            icm_gyr_y: 7,
            icm_gyr_z: 300,
            icm_acc_x: -50,
            icm_acc_y: 48,
            icm_acc_z: 1,
            icm_temp: -95,
            mmc_mag_x: -25_000,
            mmc_mag_y: 15_000,
            mmc_mag_z: 45_000,
            mmc_temp: -40,
            rdn_serial_dose: 1_020,
            rdn_sen1_dose: 918,
            rdn_sen2_dose: 1_133,
            rdn_serial_intensity: 100,
            rdn_sen1_intensity: 95,
            rdn_sen2_intensity: 105,
            rdn_temp: 215,
            rdn_vdd: 3_300,
            rdn_crystal_ok: true,
            rdn_analog_ok: false,
            encoder_sensor: 200,
            hall_endstop: 1,
            reflective_endstop: 0,
            light_sensor: 1_480,
        }
    }

    #[test]
    fn decode_telemetry_frame() {
        let frame = encode(&sample());
        assert_eq!(frame.len(), ENVELOPE_SIZE + TELEMETRY_PAYLOAD_SIZE);
        assert_eq!(decode(&frame), Ok(Frame::Telemetry(sample())));
    }

    #[test]
    fn fields_sit_at_fixed_offsets() {
        let payload = sample().to_payload();
        assert_eq!(&payload[0..2], &(-12i16).to_le_bytes());
        assert_eq!(&payload[14..18], &(-25_000i32).to_le_bytes());
        assert_eq!(&payload[28..32], &1_020u32.to_le_bytes());
        assert_eq!(&payload[54..56], &3_300i16.to_le_bytes());
        assert_eq!(payload[56], 1);
        assert_eq!(payload[57], 0);
        assert_eq!(payload[58], 200);
        assert_eq!(&payload[61..63], &1_480u16.to_le_bytes());
    }

    #[test]
    fn payload_bytes_survive_decode_and_reencode() {
        let mut payload = [0u8; TELEMETRY_PAYLOAD_SIZE];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(37).wrapping_add(11);
        }
        // health flags must be 0/1 in a valid payload
        payload[56] = 1;
        payload[57] = 0;

        let record = TelemetryRecord::from_payload(&payload).unwrap();
        assert_eq!(record.to_payload(), payload);
    }

    #[test]
    fn nonzero_flag_byte_means_ok() {
        let mut payload = sample().to_payload();
        payload[57] = 0x7f;
        let record = TelemetryRecord::from_payload(&payload).unwrap();
        assert!(record.rdn_analog_ok);
    }

    #[test]
    fn every_short_payload_is_malformed() {
        let frame = encode(&sample());
        for len in 0..frame.len() {
            let err = decode(&frame[..len]).unwrap_err();
            assert!(
                matches!(err, DecodeError::MalformedFrame { .. }),
                "len {len}: {err:?}"
            );
        }
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut frame = encode(&sample());
        frame.extend_from_slice(&[0xde, 0xad]);
        assert_eq!(decode(&frame), Ok(Frame::Telemetry(sample())));
    }

    #[test]
    fn wrong_marker_is_rejected() {
        let mut frame = encode(&sample());
        frame[0] = 0x13;
        assert_eq!(decode(&frame), Err(DecodeError::UnknownStartMarker(0x13)));
    }

    #[test]
    fn other_frame_types_pass_through() {
        let frame = [FRAME_START_MARKER, 0x09, 1, 2, 3];
        assert_eq!(
            decode(&frame),
            Ok(Frame::Other {
                frame_type: 0x09,
                payload: vec![1, 2, 3]
            })
        );
    }

    #[test]
    fn record_serializes_with_wire_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["icm_gyr_x"], -12);
        assert_eq!(json["rdn_crystal_ok"], true);
        assert_eq!(json["light_sensor"], 1_480);
    }
}

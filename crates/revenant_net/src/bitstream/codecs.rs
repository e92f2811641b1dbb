//! Compression codecs for the math types the replicated objects ship
//! most often: positions, rotations, velocities, short strings.
//!
//! Every codec trades CPU for bandwidth and is lossy within a documented
//! bound. Writer and reader halves live next to each other so the
//! symmetry contract is reviewable at a glance.

use super::{BitReader, BitWriter};
use revenant_shared::{Quat, Vec3};

/// Per-axis width of a compressed point offset.
///
/// 16 bits at the caller's scale: with a 0.01 scale that is ~327m of
/// addressable offset around the compression point at 5mm precision.
pub const COMPRESSED_POINT_BITS: u8 = 16;

const POINT_HALF_RANGE: i32 = 1 << (COMPRESSED_POINT_BITS - 1);

impl BitWriter {
    /// Encodes a position as a per-axis offset from the stream's
    /// compression point, quantized at `scale` units per step.
    ///
    /// Offsets that fit write `1 + 3*16` bits; anything farther falls back
    /// to `1 + 3*32` bits of raw floats. The reader must use the same
    /// compression point and `scale` or positions silently desync.
    pub fn write_compressed_point(&mut self, point: Vec3, scale: f32) -> bool {
        debug_assert!(scale > 0.0);
        let inv_scale = 1.0 / scale;
        let delta = point - self.compression_point();
        let qx = (delta.x * inv_scale).round();
        let qy = (delta.y * inv_scale).round();
        let qz = (delta.z * inv_scale).round();

        let limit = POINT_HALF_RANGE as f32;
        let near = qx.abs() < limit && qy.abs() < limit && qz.abs() < limit;

        if self.write_flag(near) {
            for q in [qx, qy, qz] {
                let biased = (q as i32 + POINT_HALF_RANGE) as u32;
                self.write_bits(biased, COMPRESSED_POINT_BITS);
            }
        } else {
            self.write_f32(point.x);
            self.write_f32(point.y);
            self.write_f32(point.z);
        }
        self.is_valid()
    }

    /// Encodes a unit quaternion in `3 * bits + 1` bits: the sign of `w`
    /// plus the x/y/z components, with `w` rebuilt from the unit-length
    /// constraint on decode.
    ///
    /// Input is renormalized first; a non-unit quaternion would otherwise
    /// decode to a different rotation than it encoded.
    pub fn write_quat(&mut self, quat: Quat, bits: u8) -> bool {
        let quat = quat.normalized();
        self.write_flag(quat.w < 0.0);
        self.write_signed_unit_float(quat.x, bits);
        self.write_signed_unit_float(quat.y, bits);
        self.write_signed_unit_float(quat.z, bits);
        self.is_valid()
    }

    /// Encodes a vector as magnitude + direction.
    ///
    /// One bit flags the zero vector (nothing else is written). One more
    /// bit flags a magnitude above `max_mag`, which falls back to a full
    /// 32-bit float instead of the `mag_bits` quantized fraction. The
    /// direction costs `2 * normal_bits` as yaw/pitch angles.
    pub fn write_vector(&mut self, vec: Vec3, max_mag: f32, mag_bits: u8, normal_bits: u8) -> bool {
        debug_assert!(max_mag > 0.0);
        let mag = vec.length();
        if self.write_flag(mag <= f32::EPSILON) {
            return self.is_valid();
        }

        if self.write_flag(mag > max_mag) {
            self.write_f32(mag);
        } else {
            self.write_unit_float(mag / max_mag, mag_bits);
        }

        let inv = 1.0 / mag;
        let nx = vec.x * inv;
        let ny = vec.y * inv;
        let nz = (vec.z * inv).clamp(-1.0, 1.0);
        let yaw = ny.atan2(nx);
        let pitch = nz.asin();
        self.write_signed_unit_float(yaw / std::f32::consts::PI, normal_bits);
        self.write_signed_unit_float(pitch / std::f32::consts::FRAC_PI_2, normal_bits);
        self.is_valid()
    }

    /// Writes a length-prefixed string (8-bit length, max 255 bytes).
    /// Longer input is truncated at a character boundary.
    pub fn write_string(&mut self, value: &str) -> bool {
        let mut end = value.len().min(255);
        while end > 0 && !value.is_char_boundary(end) {
            end -= 1;
        }
        let bytes = &value.as_bytes()[..end];
        self.write_bits(bytes.len() as u32, 8);
        for &byte in bytes {
            self.write_bits(u32::from(byte), 8);
        }
        self.is_valid()
    }
}

impl BitReader<'_> {
    /// Decodes a position written with [`BitWriter::write_compressed_point`]
    /// using the same compression point and `scale`.
    pub fn read_compressed_point(&mut self, scale: f32) -> Vec3 {
        debug_assert!(scale > 0.0);
        if self.read_flag() {
            let base = self.compression_point();
            let mut axes = [0.0f32; 3];
            for axis in &mut axes {
                let biased = self.read_bits(COMPRESSED_POINT_BITS) as i32;
                *axis = (biased - POINT_HALF_RANGE) as f32 * scale;
            }
            Vec3::new(base.x + axes[0], base.y + axes[1], base.z + axes[2])
        } else {
            Vec3::new(self.read_f32(), self.read_f32(), self.read_f32())
        }
    }

    /// Decodes a rotation written with [`BitWriter::write_quat`] at the
    /// same `bits`.
    pub fn read_quat(&mut self, bits: u8) -> Quat {
        let w_negative = self.read_flag();
        let x = self.read_signed_unit_float(bits);
        let y = self.read_signed_unit_float(bits);
        let z = self.read_signed_unit_float(bits);
        let w_sq = (1.0 - x * x - y * y - z * z).max(0.0);
        let w = if w_negative { -w_sq.sqrt() } else { w_sq.sqrt() };
        Quat::new(x, y, z, w).normalized()
    }

    /// Decodes a vector written with [`BitWriter::write_vector`] at the
    /// same parameters.
    pub fn read_vector(&mut self, max_mag: f32, mag_bits: u8, normal_bits: u8) -> Vec3 {
        if self.read_flag() {
            return Vec3::ZERO;
        }
        let mag = if self.read_flag() {
            self.read_f32()
        } else {
            self.read_unit_float(mag_bits) * max_mag
        };
        let yaw = self.read_signed_unit_float(normal_bits) * std::f32::consts::PI;
        let pitch = self.read_signed_unit_float(normal_bits) * std::f32::consts::FRAC_PI_2;
        let (sin_p, cos_p) = pitch.sin_cos();
        let (sin_y, cos_y) = yaw.sin_cos();
        Vec3::new(cos_p * cos_y, cos_p * sin_y, sin_p) * mag
    }

    /// Reads a string written with [`BitWriter::write_string`]. Returns an
    /// empty string if the stream errors mid-read; invalid UTF-8 bytes are
    /// replaced rather than trusted.
    pub fn read_string(&mut self) -> String {
        let len = self.read_bits(8) as usize;
        let mut bytes = Vec::with_capacity(len);
        for _ in 0..len {
            bytes.push(self.read_bits(8) as u8);
        }
        if !self.is_valid() {
            return String::new();
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Leaky-bucket model of the decoder buffer.
//!
//! Time is counted in ticks of `1 / time_scale` seconds; a picture normally lasts `frame_ticks`
//! ticks. The channel drains `bit_rate` bits per second from the bucket and every coded picture
//! pours its bits in.

#[derive(Clone, Debug)]
pub struct VirtualBuffer {
    bit_rate: u64,
    time_scale: u32,
    frame_ticks: u32,
    buffer_size: u64,
    /// Ticks elapsed since the last rate change.
    ticks: u64,
    /// Channel bits accumulated before the last rate change.
    virtual_base: u64,
    virtual_bit_cnt: u64,
    real_bit_cnt: u64,
    occupancy: u64,
}

impl VirtualBuffer {
    pub fn new(bit_rate: u64, time_scale: u32, frame_ticks: u32, buffer_size: u64) -> Self {
        Self {
            bit_rate,
            time_scale: time_scale.max(1),
            frame_ticks: frame_ticks.max(1),
            buffer_size,
            ticks: 0,
            virtual_base: 0,
            virtual_bit_cnt: 0,
            real_bit_cnt: 0,
            occupancy: 0,
        }
    }

    /// Lets `time_inc` ticks pass. Returns the number of bits drained from the bucket.
    ///
    /// The channel bit count is recomputed from the total elapsed time, so rounding remainders
    /// never accumulate.
    pub fn advance(&mut self, time_inc: u32) -> u64 {
        self.ticks += u64::from(time_inc);
        let elapsed = u128::from(self.bit_rate) * u128::from(self.ticks);
        let elapsed = (elapsed / u128::from(self.time_scale)) as u64;
        let virtual_bit_cnt = self.virtual_base + elapsed;

        let drained = virtual_bit_cnt - self.virtual_bit_cnt;
        self.virtual_bit_cnt = virtual_bit_cnt;
        self.occupancy = self.occupancy.saturating_sub(drained);

        drained
    }

    /// Number of bits by which a picture of `bits` would overflow the bucket, if any.
    pub fn excess(&self, bits: u64) -> Option<u64> {
        (self.occupancy + bits)
            .checked_sub(self.buffer_size)
            .filter(|excess| *excess > 0)
    }

    pub fn add_bits(&mut self, bits: u64) {
        self.real_bit_cnt += bits;
        self.occupancy = (self.occupancy + bits).min(self.buffer_size);
    }

    /// Bits produced minus bits the channel carried, clamped to the buffer size. Positive when
    /// the encoder is overspending.
    pub fn deviation(&self) -> i64 {
        let deviation = self.real_bit_cnt as i128 - self.virtual_bit_cnt as i128;
        let limit = self.buffer_size as i128;
        deviation.clamp(-limit, limit) as i64
    }

    pub fn occupancy(&self) -> u64 {
        self.occupancy
    }

    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    /// Room left in the bucket.
    pub fn headroom(&self) -> u64 {
        self.buffer_size.saturating_sub(self.occupancy)
    }

    pub fn bit_rate(&self) -> u64 {
        self.bit_rate
    }

    /// Average channel bits per picture.
    pub fn bits_per_pic(&self) -> f64 {
        self.bit_rate as f64 * f64::from(self.frame_ticks) / f64::from(self.time_scale)
    }

    /// Fewest bits drained over one picture duration.
    pub fn min_drain_per_pic(&self) -> u64 {
        (u128::from(self.bit_rate) * u128::from(self.frame_ticks) / u128::from(self.time_scale))
            as u64
    }

    pub fn virtual_bit_cnt(&self) -> u64 {
        self.virtual_bit_cnt
    }

    pub fn real_bit_cnt(&self) -> u64 {
        self.real_bit_cnt
    }

    /// Changes the channel parameters, keeping the bits accounted so far.
    pub fn set_rate(&mut self, bit_rate: u64, time_scale: u32, frame_ticks: u32, buffer_size: u64) {
        self.virtual_base = self.virtual_bit_cnt;
        self.ticks = 0;
        self.bit_rate = bit_rate;
        self.time_scale = time_scale.max(1);
        self.frame_ticks = frame_ticks.max(1);
        self.buffer_size = buffer_size;
        self.occupancy = self.occupancy.min(buffer_size);
    }

    pub fn reset(&mut self) {
        *self = Self::new(
            self.bit_rate,
            self.time_scale,
            self.frame_ticks,
            self.buffer_size,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_keeps_remainders() {
        // 1000 bits/s at 3 fps does not divide evenly.
        let mut vb = VirtualBuffer::new(1000, 3, 1, 10_000);
        let drained = (0..3).map(|_| vb.advance(1)).collect::<Vec<_>>();

        assert_eq!(drained, vec![333, 333, 334]);
        assert_eq!(vb.virtual_bit_cnt(), 1000);
        assert_eq!(vb.min_drain_per_pic(), 333);
    }

    #[test]
    fn occupancy_is_clamped() {
        let mut vb = VirtualBuffer::new(1000, 10, 1, 500);

        vb.add_bits(400);
        assert_eq!(vb.excess(50), None);
        assert_eq!(vb.excess(150), Some(50));

        vb.add_bits(400);
        assert_eq!(vb.occupancy(), 500);
        assert_eq!(vb.headroom(), 0);

        for _ in 0..10 {
            vb.advance(1);
        }
        assert_eq!(vb.occupancy(), 0);
    }

    #[test]
    fn deviation_tracks_overspending() {
        let mut vb = VirtualBuffer::new(30_000, 30, 1, 1_000_000);

        for _ in 0..30 {
            vb.advance(1);
            vb.add_bits(1500);
        }
        assert_eq!(vb.deviation(), 15_000);

        for _ in 0..30 {
            vb.advance(1);
            vb.add_bits(0);
        }
        assert_eq!(vb.deviation(), -15_000);
    }

    #[test]
    fn rate_change_keeps_history() {
        let mut vb = VirtualBuffer::new(3000, 30, 1, 100_000);
        for _ in 0..30 {
            vb.advance(1);
        }
        assert_eq!(vb.virtual_bit_cnt(), 3000);

        vb.set_rate(6000, 30, 1, 100_000);
        assert_eq!(vb.bits_per_pic(), 200.0);
        for _ in 0..30 {
            vb.advance(1);
        }
        assert_eq!(vb.virtual_bit_cnt(), 9000);
    }
}

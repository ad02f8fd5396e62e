use serde::Serialize;

pub const DECILES: usize = 11;
pub const FULL_OPEN: u8 = 10;

/// Learned rate of temperature change per register opening decile, in degrees
/// per minute. A zero entry means "no data".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RateTable {
    rates: [f32; DECILES],
}

impl RateTable {
    pub fn get(&self, decile: u8) -> Option<f32> {
        self.rates
            .get(usize::from(decile))
            .copied()
            .filter(|rate| *rate > 0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.rates.iter().all(|rate| *rate == 0.0)
    }

    /// Stores an observed rate for `decile`. The first observation seeds the whole
    /// row by scaling linearly through zero; later ones overwrite only their own
    /// decile. Observations at decile 0 or with a non-positive rate say nothing
    /// about the room and are dropped.
    pub fn record(&mut self, decile: u8, rate: f32) -> bool {
        let index = usize::from(decile);
        if index == 0 || index >= DECILES || !rate.is_finite() || rate <= 0.0 {
            return false;
        }

        if self.is_empty() {
            for (k, slot) in self.rates.iter_mut().enumerate() {
                *slot = rate * k as f32 / index as f32;
            }
        } else {
            self.rates[index] = rate;
        }
        true
    }

    pub fn projected_secs(&self, decile: u8, difference: i32) -> Option<f32> {
        self.get(decile)
            .map(|rate| difference as f32 * 60.0 / rate)
    }

    /// The decile whose projected time is closest to `target_secs`. Deciles
    /// without data are skipped and ties go to the smaller opening.
    pub fn nearest_decile(&self, difference: i32, target_secs: f32) -> Option<u8> {
        let mut best: Option<(u8, f32)> = None;
        for decile in 0..=FULL_OPEN {
            let Some(secs) = self.projected_secs(decile, difference) else {
                continue;
            };
            let distance = (secs - target_secs).abs();
            match best {
                Some((_, best_distance)) if distance >= best_distance => {}
                _ => best = Some((decile, distance)),
            }
        }
        best.map(|(decile, _)| decile)
    }
}

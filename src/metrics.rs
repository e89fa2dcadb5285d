use serde::Serialize;

/// The six quantities reported for every training step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct StepMetrics {
    pub gen_g_loss: f32,
    pub gen_f_loss: f32,
    pub disc_x_loss: f32,
    pub disc_y_loss: f32,
    pub cycle_loss: f32,
    pub identity_loss: f32,
}
impl StepMetrics {
    pub fn is_finite(&self) -> bool {
        self.values().iter().all(|value| value.is_finite())
    }

    fn values(&self) -> [f32; 6] {
        [
            self.gen_g_loss,
            self.gen_f_loss,
            self.disc_x_loss,
            self.disc_y_loss,
            self.cycle_loss,
            self.identity_loss,
        ]
    }
}
impl std::fmt::Display for StepMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[G loss: {:+.5}, F loss: {:+.5}][Dx loss: {:+.5}, Dy loss: {:+.5}][cycle: {:.5}, identity: {:.5}]",
            self.gen_g_loss,
            self.gen_f_loss,
            self.disc_x_loss,
            self.disc_y_loss,
            self.cycle_loss,
            self.identity_loss,
        )
    }
}

/// Running mean of every `StepMetrics` field since the last reset.
#[derive(Clone, Debug, Default)]
pub struct LossTracker {
    sum: [f64; 6],
    count: usize,
}
impl LossTracker {
    pub fn update(&mut self, metrics: &StepMetrics) {
        for (sum, value) in self.sum.iter_mut().zip(metrics.values()) {
            *sum += value as f64;
        }
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> StepMetrics {
        if self.count == 0 {
            return StepMetrics::default();
        }
        let n = self.count as f64;
        let m = self.sum.map(|sum| (sum / n) as f32);

        StepMetrics {
            gen_g_loss: m[0],
            gen_f_loss: m[1],
            disc_x_loss: m[2],
            disc_y_loss: m[3],
            cycle_loss: m[4],
            identity_loss: m[5],
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

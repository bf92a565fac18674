/// A cubic polynomial segment of constant third derivative ("jerk"),
/// defined on `[0, length]` by its initial value, slope and curvature.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConstantJerkSegment {
    p0: f64,
    v0: f64,
    a0: f64,
    jerk: f64,
    length: f64,
    end: [f64; 3],
}

impl ConstantJerkSegment {
    pub fn new(p0: f64, v0: f64, a0: f64, jerk: f64, length: f64) -> Self {
        let mut segment = Self {
            p0,
            v0,
            a0,
            jerk,
            length,
            end: [p0, v0, a0],
        };
        segment.end = [
            segment.evaluate(0, length),
            segment.evaluate(1, length),
            segment.evaluate(2, length),
        ];
        segment
    }

    /// Evaluates the `order`-th derivative at `x`, measured from the start of the segment.
    /// Orders above 3 are identically zero.
    pub fn evaluate(&self, order: u32, x: f64) -> f64 {
        let j = self.jerk;
        match order {
            0 => self.p0 + x * (self.v0 + x * (0.5 * self.a0 + x * j / 6.0)),
            1 => self.v0 + x * (self.a0 + 0.5 * j * x),
            2 => self.a0 + j * x,
            3 => j,
            _ => 0.0,
        }
    }

    pub fn length(&self) -> f64 {
        self.length
    }

    pub fn jerk(&self) -> f64 {
        self.jerk
    }

    /// The value, slope and curvature at the end of the segment.
    pub fn end_state(&self) -> [f64; 3] {
        self.end
    }
}

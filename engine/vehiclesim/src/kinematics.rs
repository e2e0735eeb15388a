//! Drivetrain model: maps road speed to gear and engine rpm.

/// Engine speed when stationary or crawling in first gear.
pub const IDLE_RPM: u32 = 800;

/// Engine speed right after an upshift into gear 2 and above.
const UPSHIFT_RPM: f64 = 1400.0;

/// Engine speed at which the next gear is selected.
const SHIFT_RPM: f64 = 3000.0;

/// Upper speed bound (km/h) of gears 1..=5; gear 6 covers everything above.
const GEAR_LIMITS_KMH: [f64; 5] = [20.0, 35.0, 50.0, 70.0, 95.0];

/// Speed span assumed for top gear when scaling rpm.
const TOP_GEAR_SPAN_KMH: f64 = 40.0;

pub const TOP_GEAR: u8 = GEAR_LIMITS_KMH.len() as u8 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drivetrain {
    pub gear: u8,
    pub rpm: u32,
}

impl Drivetrain {
    pub const IDLE: Drivetrain = Drivetrain {
        gear: 0,
        rpm: IDLE_RPM,
    };

    /// Gear and rpm for a road speed. Non-positive (or NaN) speed is idle.
    pub fn for_speed(speed_kmh: f64) -> Self {
        if speed_kmh.is_nan() || speed_kmh <= 0.0 {
            return Self::IDLE;
        }

        let band = GEAR_LIMITS_KMH
            .iter()
            .position(|&limit| speed_kmh < limit)
            .unwrap_or(GEAR_LIMITS_KMH.len());

        let lower = if band == 0 { 0.0 } else { GEAR_LIMITS_KMH[band - 1] };
        let upper = GEAR_LIMITS_KMH
            .get(band)
            .copied()
            .unwrap_or(lower + TOP_GEAR_SPAN_KMH);
        let fraction = ((speed_kmh - lower) / (upper - lower)).clamp(0.0, 1.0);

        let floor = if band == 0 {
            IDLE_RPM as f64
        } else {
            UPSHIFT_RPM
        };
        let rpm = floor + fraction * (SHIFT_RPM - floor);

        Self {
            gear: band as u8 + 1,
            rpm: rpm.round() as u32,
        }
    }
}

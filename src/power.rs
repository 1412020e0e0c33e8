pub const DEFAULT_PSU_CAPACITY_WATTS: f64 = 750.0;

/// No draw means no reading, so the headroom is reported as 0 rather than 100.
pub fn psu_headroom_percent(total_draw_watts: f64, capacity_watts: f64) -> f64 {
    if total_draw_watts <= 0.0 || capacity_watts <= 0.0 || !total_draw_watts.is_finite() {
        return 0.0;
    }
    ((1.0 - total_draw_watts / capacity_watts) * 100.0).clamp(0.0, 100.0)
}

// ==================== LEVEL CALCULATOR ====================
//
// XP → level mapping:
//   [0,100)     = 1
//   [100,250)   = 2
//   [250,500)   = 3
//   [500,1000)  = 4
//   [1000,2000) = 5
//   >= 2000     = 3 + (xp - 500) / 100   (2000 XP is level 18)
//
// Levels 6..=17 are never produced. The inverse maps them to 2000 XP,
// the first XP at which the player is at least that level.

/// First level produced by the linear high-XP formula
pub const FIRST_LINEAR_LEVEL: u32 = 18;

/// XP at which the linear formula takes over
const LINEAR_XP_START: u64 = 2000;

/// Base of the linear formula: level 3 at 500 XP, +1 level per 100 XP
const LINEAR_BASE_LEVEL: u32 = 3;
const LINEAR_BASE_XP: u64 = 500;
const LINEAR_XP_PER_LEVEL: u64 = 100;

/// Level for a total XP amount (always >= 1)
pub fn calculate_level(xp: u64) -> u32 {
    match xp {
        0..=99 => 1,
        100..=249 => 2,
        250..=499 => 3,
        500..=999 => 4,
        1000..=1999 => 5,
        _ => {
            let steps = (xp - LINEAR_BASE_XP) / LINEAR_XP_PER_LEVEL;
            LINEAR_BASE_LEVEL.saturating_add(u32::try_from(steps).unwrap_or(u32::MAX))
        }
    }
}

/// Minimum total XP needed to be at `level`
pub fn get_xp_for_level(level: u32) -> u64 {
    match level {
        0 | 1 => 0,
        2 => 100,
        3 => 250,
        4 => 500,
        5 => 1000,
        l if l < FIRST_LINEAR_LEVEL => LINEAR_XP_START,
        _ => LINEAR_BASE_XP + u64::from(level - LINEAR_BASE_LEVEL) * LINEAR_XP_PER_LEVEL,
    }
}

/// XP still needed for the next level; 0 when no further level is defined
pub fn get_xp_to_next_level(xp: u64) -> u64 {
    let level = calculate_level(xp);
    let current_floor = get_xp_for_level(level);
    let next_floor = get_xp_for_level(level.saturating_add(1));

    if next_floor <= current_floor {
        return 0;
    }
    next_floor.saturating_sub(xp)
}

/// Progress through the current level band, clamped to [0, 100]
pub fn get_level_progress_percentage(xp: u64) -> f64 {
    if get_xp_to_next_level(xp) == 0 {
        return 100.0;
    }

    let level = calculate_level(xp);
    let current_floor = get_xp_for_level(level);
    let next_floor = get_xp_for_level(level + 1);
    let needed = next_floor.saturating_sub(current_floor);
    if needed == 0 {
        return 0.0;
    }

    let gained = xp.saturating_sub(current_floor);
    let percentage = gained as f64 / needed as f64 * 100.0;
    percentage.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_boundaries() {
        assert_eq!(calculate_level(0), 1);
        assert_eq!(calculate_level(99), 1);
        assert_eq!(calculate_level(100), 2);
        assert_eq!(calculate_level(249), 2);
        assert_eq!(calculate_level(250), 3);
        assert_eq!(calculate_level(499), 3);
        assert_eq!(calculate_level(500), 4);
        assert_eq!(calculate_level(999), 4);
        assert_eq!(calculate_level(1000), 5);
        assert_eq!(calculate_level(1999), 5);
    }

    #[test]
    fn test_linear_formula_above_2000() {
        assert_eq!(calculate_level(2000), 18);
        assert_eq!(calculate_level(2099), 18);
        assert_eq!(calculate_level(2100), 19);
        assert_eq!(calculate_level(3450), 32);
        // No overflow at the top of the range
        assert!(calculate_level(u64::MAX) >= FIRST_LINEAR_LEVEL);
    }

    #[test]
    fn test_level_is_monotonic() {
        let mut previous = calculate_level(0);
        assert!(previous >= 1);
        for xp in 1..6000 {
            let level = calculate_level(xp);
            assert!(level >= previous, "level dropped at xp {}", xp);
            previous = level;
        }
    }

    #[test]
    fn test_inverse_round_trip() {
        for level in (1..=5).chain(FIRST_LINEAR_LEVEL..80) {
            assert_eq!(calculate_level(get_xp_for_level(level)), level, "level {}", level);
        }
        // One XP less lands in the previous reachable level
        assert_eq!(calculate_level(get_xp_for_level(2) - 1), 1);
        assert_eq!(calculate_level(get_xp_for_level(FIRST_LINEAR_LEVEL) - 1), 5);
    }

    #[test]
    fn test_skipped_levels() {
        for level in 6..FIRST_LINEAR_LEVEL {
            assert_eq!(get_xp_for_level(level), 2000);
            assert_ne!(calculate_level(get_xp_for_level(level)), level);
        }
        assert_eq!(get_xp_for_level(0), 0);
    }

    #[test]
    fn test_xp_to_next_level() {
        assert_eq!(get_xp_to_next_level(0), 100);
        assert_eq!(get_xp_to_next_level(95), 5);
        assert_eq!(get_xp_to_next_level(100), 150);
        assert_eq!(get_xp_to_next_level(1500), 500);
        assert_eq!(get_xp_to_next_level(2000), 100);
        assert_eq!(get_xp_to_next_level(2150), 50);
    }

    #[test]
    fn test_level_progress_percentage() {
        assert_eq!(get_level_progress_percentage(0), 0.0);
        assert_eq!(get_level_progress_percentage(50), 50.0);
        assert_eq!(get_level_progress_percentage(175), 50.0);
        assert_eq!(get_level_progress_percentage(1500), 50.0);
        assert_eq!(get_level_progress_percentage(2025), 25.0);
        for xp in [0, 99, 100, 999, 1999, 2000, 12345] {
            let pct = get_level_progress_percentage(xp);
            assert!((0.0..=100.0).contains(&pct));
        }
    }
}

/// Two-decimal rounding used for money and percentages: `round(100*x) / 100`,
/// half away from zero.
pub fn round_off_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub fn percentage(obtained: f64, max: f64) -> f64 {
    if max <= 0.0 {
        return 0.0;
    }
    round_off_2_decimals(100.0 * obtained / max)
}

const GRADE_BANDS: &[(f64, &str)] = &[
    (90.0, "A+"),
    (80.0, "A"),
    (70.0, "B+"),
    (60.0, "B"),
    (50.0, "C"),
    (40.0, "D"),
];

pub fn grade_for_percentage(pct: f64) -> &'static str {
    GRADE_BANDS
        .iter()
        .find(|(min, _)| pct >= *min)
        .map(|(_, g)| *g)
        .unwrap_or("F")
}

/// Competition ranking ("1224"): equal totals share a rank and the next
/// distinct total skips ahead. Input order is preserved in the output.
pub fn competition_ranks(totals: &[f64]) -> Vec<usize> {
    totals
        .iter()
        .map(|t| 1 + totals.iter().filter(|other| **other > *t).count())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grade_band_edges() {
        assert_eq!(grade_for_percentage(100.0), "A+");
        assert_eq!(grade_for_percentage(90.0), "A+");
        assert_eq!(grade_for_percentage(89.99), "A");
        assert_eq!(grade_for_percentage(60.0), "B");
        assert_eq!(grade_for_percentage(40.0), "D");
        assert_eq!(grade_for_percentage(39.99), "F");
        assert_eq!(grade_for_percentage(0.0), "F");
    }

    #[test]
    fn percentage_handles_zero_max() {
        assert_eq!(percentage(10.0, 0.0), 0.0);
        assert_eq!(percentage(2.0, 3.0), 66.67);
    }

    #[test]
    fn ties_share_rank() {
        assert_eq!(
            competition_ranks(&[70.0, 90.0, 70.0, 50.0]),
            vec![2, 1, 2, 4]
        );
        assert!(competition_ranks(&[]).is_empty());
    }
}

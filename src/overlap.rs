use chrono::{DateTime, Duration, Utc};

/// 2つの時間区間の重なりを返す。重ならない場合はゼロ（負にはならない）。
///
/// システム内の時間計算はすべてこの関数を経由する。
pub fn overlap(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> Duration {
    let start = a_start.max(b_start);
    let end = a_end.min(b_end);
    if end > start {
        end - start
    } else {
        Duration::zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, min, 0).unwrap()
    }

    #[test]
    fn symmetric() {
        let a = (t(10, 0), t(11, 0));
        let b = (t(10, 30), t(12, 0));
        assert_eq!(
            overlap(a.0, a.1, b.0, b.1),
            overlap(b.0, b.1, a.0, a.1),
        );
    }

    #[test]
    fn partial_overlap() {
        let d = overlap(t(10, 0), t(11, 0), t(10, 30), t(12, 0));
        assert_eq!(d, Duration::minutes(30));
    }

    #[test]
    fn containment_yields_inner_length() {
        let d = overlap(t(9, 0), t(18, 0), t(10, 0), t(10, 45));
        assert_eq!(d, Duration::minutes(45));
    }

    #[test]
    fn disjoint_is_zero_not_negative() {
        let d = overlap(t(8, 0), t(9, 0), t(10, 0), t(11, 0));
        assert_eq!(d, Duration::zero());
    }

    #[test]
    fn touching_endpoints_is_zero() {
        let d = overlap(t(8, 0), t(9, 0), t(9, 0), t(10, 0));
        assert_eq!(d, Duration::zero());
    }
}

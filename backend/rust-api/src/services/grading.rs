use crate::models::GradingScheme;

/// Grade of one finalized cycle.
///
/// Standard only looks at the second answer; Advanced gives half credit for each
/// correct answer.
pub fn grade(scheme: GradingScheme, first_correct: bool, second_correct: bool) -> f64 {
    match scheme {
        GradingScheme::Standard => {
            if second_correct {
                1.0
            } else {
                0.0
            }
        }
        GradingScheme::Advanced => {
            let mut grade = 0.0;
            if first_correct {
                grade += 0.5;
            }
            if second_correct {
                grade += 0.5;
            }
            grade
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_scheme_uses_second_answer_only() {
        assert_eq!(grade(GradingScheme::Standard, false, true), 1.0);
        assert_eq!(grade(GradingScheme::Standard, true, true), 1.0);
        assert_eq!(grade(GradingScheme::Standard, true, false), 0.0);
        assert_eq!(grade(GradingScheme::Standard, false, false), 0.0);
    }

    #[test]
    fn test_advanced_scheme_partial_credit() {
        assert_eq!(grade(GradingScheme::Advanced, true, true), 1.0);
        assert_eq!(grade(GradingScheme::Advanced, true, false), 0.5);
        assert_eq!(grade(GradingScheme::Advanced, false, true), 0.5);
        assert_eq!(grade(GradingScheme::Advanced, false, false), 0.0);
    }
}

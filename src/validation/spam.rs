use super::external::ExternalTool;
use super::Check;
use crate::config::SpamCheckConfig;

/// Spam scoring through a classification client such as `spamc -c`, which
/// prints `score/threshold` and uses its exit status for the verdict.
#[derive(Debug, Clone)]
pub struct SpamCheck {
    tool: Option<ExternalTool>,
    reject_threshold: Option<f64>,
}

impl SpamCheck {
    pub fn from_config(config: &SpamCheckConfig) -> Self {
        Self {
            tool: ExternalTool::resolve(
                "Spam score",
                config.enabled,
                &config.command,
                &config.args,
                config.timeout_seconds,
            ),
            reject_threshold: config.reject_threshold,
        }
    }

    pub fn with_tool(tool: Option<ExternalTool>, reject_threshold: Option<f64>) -> Self {
        Self {
            tool,
            reject_threshold,
        }
    }

    pub async fn score(&self, raw: &[u8]) -> Check<f64> {
        let Some(tool) = &self.tool else {
            return Check::Disabled;
        };

        match tool.run(&[], Some(raw)).await {
            Ok(output) => match parse_score(&output.stdout) {
                Some(score) => {
                    log::debug!("Spam score {score}");
                    Check::Enabled(score)
                }
                None => {
                    log::error!("Unable to compute spam score from {:?}", output.stdout.trim());
                    Check::Enabled(0.0)
                }
            },
            Err(e) => {
                log::error!("Spam score computation failed: {e}");
                Check::Enabled(0.0)
            }
        }
    }

    /// Whether a computed score must lead to rejection.
    pub fn exceeds_threshold(&self, score: Check<f64>) -> bool {
        match (score, self.reject_threshold) {
            (Check::Enabled(score), Some(threshold)) => score >= threshold,
            _ => false,
        }
    }
}

/// Parse the `score/threshold` line printed by `spamc -c`.
fn parse_score(stdout: &str) -> Option<f64> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let score = line.split('/').next()?.trim();
    score.parse::<f64>().ok().filter(|s| s.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> Option<ExternalTool> {
        ExternalTool::resolve("test", true, "sh", &["-c".to_string(), script.to_string()], 5)
    }

    #[test]
    fn test_parse_score() {
        assert_eq!(parse_score("4.2/5.0\n"), Some(4.2));
        assert_eq!(parse_score("\n -1.3/5.0"), Some(-1.3));
        assert_eq!(parse_score("0/0\n"), Some(0.0));
        assert_eq!(parse_score(""), None);
        assert_eq!(parse_score("garbage"), None);
    }

    #[tokio::test]
    async fn test_score_from_tool() {
        // exit status 1 is spamc's "is spam" verdict, the score is still read
        let check = SpamCheck::with_tool(shell("cat > /dev/null; echo 7.5/5.0; exit 1"), Some(5.0));
        let score = check.score(b"Subject: buy now\r\n\r\n!!!\r\n").await;
        assert_eq!(score, Check::Enabled(7.5));
        assert!(check.exceeds_threshold(score));
    }

    #[tokio::test]
    async fn test_unparsable_output_scores_zero() {
        let check = SpamCheck::with_tool(shell("cat > /dev/null; echo oops"), None);
        assert_eq!(check.score(b"x").await, Check::Enabled(0.0));
    }

    #[tokio::test]
    async fn test_disabled_scores_nothing() {
        let check = SpamCheck::from_config(&SpamCheckConfig::default());
        let score = check.score(b"x").await;
        assert_eq!(score, Check::Disabled);
        assert_eq!(score.value_or(0.0), 0.0);
        assert!(!check.exceeds_threshold(score));
    }

    #[test]
    fn test_threshold() {
        let check = SpamCheck::with_tool(None, Some(5.0));
        assert!(!check.exceeds_threshold(Check::Enabled(4.9)));
        assert!(check.exceeds_threshold(Check::Enabled(5.0)));

        let no_threshold = SpamCheck::with_tool(None, None);
        assert!(!no_threshold.exceeds_threshold(Check::Enabled(100.0)));
    }
}

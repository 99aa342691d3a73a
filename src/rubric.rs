use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Rubric attached to an assignment. Stored serialized on the
/// assignment row, but validated as a typed tree whenever it is
/// written so readers never have to parse defensively.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Rubric {
    pub questions: Vec<Question>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Question {
    pub question_id: String,
    pub title: String,
    pub max_points: f64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub comment_presets: Vec<CommentPreset>,
    #[serde(default)]
    pub checks: Vec<RangeCheck>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CommentPreset {
    pub label: String,
    pub text: String,
    #[serde(default)]
    pub deduction: Option<f64>,
}

/// Structural assertion over a spreadsheet range, evaluated against the
/// extracted formula map (never against live workbook state).
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RangeCheck {
    MustContainFormulas {
        #[serde(default)]
        sheet: Option<String>,
        range: String,
    },
    MustNotBeHardcoded {
        #[serde(default)]
        sheet: Option<String>,
        range: String,
    },
    MustUseFunction {
        #[serde(default)]
        sheet: Option<String>,
        range: String,
        function: String,
    },
    MustHavePivot,
}

impl Rubric {
    pub fn parse(raw: &str) -> anyhow::Result<Rubric> {
        let rubric: Rubric = serde_json::from_str(raw)?;
        rubric.validate()?;
        Ok(rubric)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for q in &self.questions {
            if q.question_id.trim().is_empty() {
                anyhow::bail!("question_id must not be empty");
            }
            if !seen.insert(q.question_id.as_str()) {
                anyhow::bail!("duplicate question_id: {}", q.question_id);
            }
            if !q.max_points.is_finite() || q.max_points < 0.0 {
                anyhow::bail!("question {}: max_points must be >= 0", q.question_id);
            }
            for p in &q.comment_presets {
                if let Some(d) = p.deduction {
                    if !d.is_finite() || d < 0.0 {
                        anyhow::bail!(
                            "question {}: preset deduction must be >= 0",
                            q.question_id
                        );
                    }
                }
            }
            for c in &q.checks {
                c.validate()
                    .map_err(|e| anyhow::anyhow!("question {}: {}", q.question_id, e))?;
            }
        }
        Ok(())
    }

    pub fn question(&self, question_id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.question_id == question_id)
    }
}

impl RangeCheck {
    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            RangeCheck::MustContainFormulas { range, .. }
            | RangeCheck::MustNotBeHardcoded { range, .. } => {
                crate::workbook::parse_range(range)?;
                Ok(())
            }
            RangeCheck::MustUseFunction {
                range, function, ..
            } => {
                crate::workbook::parse_range(range)?;
                if function.trim().is_empty() {
                    anyhow::bail!("function name must not be empty");
                }
                Ok(())
            }
            RangeCheck::MustHavePivot => Ok(()),
        }
    }
}

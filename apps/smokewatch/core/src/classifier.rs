use serde::{Deserialize, Serialize};

use crate::detection::DetectedObject;

pub const DEFAULT_PROXIMITY_MARGIN: f32 = 50.0;
pub const DEFAULT_PERSON_LABEL: &str = "person";
pub const DEFAULT_CIGARETTE_LABEL: &str = "cigarette";

/// Labels and proximity margin used to pair people with cigarettes.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierConfig {
    /// Pixels added on every side of a person box before testing the cigarette center.
    pub margin: f32,
    pub person_label: String,
    pub cigarette_label: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            margin: DEFAULT_PROXIMITY_MARGIN,
            person_label: DEFAULT_PERSON_LABEL.to_string(),
            cigarette_label: DEFAULT_CIGARETTE_LABEL.to_string(),
        }
    }
}

impl ClassifierConfig {
    pub fn with_margin(mut self, margin: f32) -> Self {
        self.margin = margin;
        self
    }
}

/// Track ids of a person and a cigarette found close to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmokingPair {
    pub person_id: Option<i64>,
    pub cigarette_id: Option<i64>,
}

/// Per-frame smoking decision.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SmokingVerdict {
    pub has_person: bool,
    pub has_cigarette: bool,
    pub is_smoking: bool,
    #[serde(rename = "smoking_pairs")]
    pub paired_ids: Vec<SmokingPair>,
    pub max_confidence: f32,
}

impl SmokingVerdict {
    /// Verdict used when no detector output is available for a frame.
    pub fn neutral() -> Self {
        Self::default()
    }
}

/// Pairs every person with every cigarette whose box center falls inside the person box
/// grown by `config.margin`. Any such pair marks the frame as smoking.
pub fn classify(objects: &[DetectedObject], config: &ClassifierConfig) -> SmokingVerdict {
    let persons: Vec<&DetectedObject> = objects
        .iter()
        .filter(|object| object.has_label(&config.person_label))
        .collect();
    let cigarettes: Vec<&DetectedObject> = objects
        .iter()
        .filter(|object| object.has_label(&config.cigarette_label))
        .collect();

    let mut verdict = SmokingVerdict {
        has_person: !persons.is_empty(),
        has_cigarette: !cigarettes.is_empty(),
        ..SmokingVerdict::default()
    };

    for person in &persons {
        let reach = person.bbox.expanded(config.margin);
        for cigarette in &cigarettes {
            let (cx, cy) = cigarette.bbox.center();
            if !reach.contains(cx, cy) {
                continue;
            }
            verdict.is_smoking = true;
            verdict.paired_ids.push(SmokingPair {
                person_id: person.track_id,
                cigarette_id: cigarette.track_id,
            });
            let pair_confidence = person.confidence.max(cigarette.confidence);
            if pair_confidence > verdict.max_confidence {
                verdict.max_confidence = pair_confidence;
            }
        }
    }

    verdict
}

//! Good/bad topic classification.
//!
//! Each topic is judged on its most recent tagged snapshot only: positive
//! labels (neutral, happy) and negative labels (sad, anger, disgust, fear)
//! are summed across every face, surprise is ignored, and ties are good.

use crate::store::TopicMap;
use crate::types::{Polarity, TaggedSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Summed scores behind one topic's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TopicScore {
    pub good_score: f32,
    pub bad_score: f32,
}

impl TopicScore {
    pub fn of(snapshot: &TaggedSnapshot) -> Self {
        snapshot
            .scores()
            .fold(TopicScore::default(), |mut acc, (label, score)| {
                match label.polarity() {
                    Polarity::Positive => acc.good_score += score,
                    Polarity::Negative => acc.bad_score += score,
                    Polarity::Ignored => {}
                }
                acc
            })
    }

    pub fn is_good(&self) -> bool {
        self.good_score >= self.bad_score
    }
}

/// Disjoint partition of every non-empty topic, keyed by display name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Classification {
    pub good_topics: BTreeMap<String, TopicScore>,
    pub bad_topics: BTreeMap<String, TopicScore>,
}

impl Classification {
    pub fn len(&self) -> usize {
        self.good_topics.len() + self.bad_topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Classify every topic in a frozen store copy.
pub fn classify(topics: &TopicMap) -> Classification {
    let mut out = Classification::default();
    for history in topics.values() {
        let Some(last) = history.last() else {
            continue;
        };
        let score = TopicScore::of(last);
        let side = if score.is_good() {
            &mut out.good_topics
        } else {
            &mut out.bad_topics
        };
        side.insert(history.topic.clone(), score);
    }
    out
}

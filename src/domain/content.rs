//! Generated learning content exchanged with text generation services.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Summary of a source document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub main_ideas: Vec<String>,
    pub key_concepts: BTreeMap<String, String>,
    pub word_count: usize,
}

/// A generated quiz.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quiz {
    pub questions: Vec<Question>,
}

/// A single quiz question.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub question_text: String,
    pub options: Vec<String>,
    pub correct_answer: String,
}

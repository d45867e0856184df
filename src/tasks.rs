use crate::models::Role;
use crate::request::ApiMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One-shot requests the add-in panels issue outside the chat.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    AnalyzeExcel { excel_data: Value },
    GenerateFormula { requirement: String },
    AnalyzeText { text: String, analysis_type: String },
    SummarizeDocument { text: String, percentage: u8 },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::AnalyzeExcel { .. } => "analyze_excel",
            Task::GenerateFormula { .. } => "generate_formula",
            Task::AnalyzeText { .. } => "analyze_text",
            Task::SummarizeDocument { .. } => "summarize_document",
        }
    }

    pub fn messages(&self) -> Vec<ApiMessage> {
        let (system, user) = match self {
            Task::AnalyzeExcel { excel_data } => (
                "You are a professional data analysis assistant and an Excel expert. Analyze the data below and provide insights.".to_string(),
                format!("Please analyze the following Excel data:\n{}", excel_data),
            ),
            Task::GenerateFormula { requirement } => (
                "You are an Excel formula expert who writes the best formula for a requirement.".to_string(),
                format!("Please write an Excel formula for this requirement:\n{}", requirement),
            ),
            Task::AnalyzeText { text, analysis_type } => (
                "You are a text analysis expert who assesses readability, sentiment and keywords.".to_string(),
                format!("Please perform a {} analysis of the following text:\n{}", analysis_type, text),
            ),
            Task::SummarizeDocument { text, percentage } => (
                "You are a document summarization expert who extracts the key information accurately.".to_string(),
                format!(
                    "Please summarize the following document in about {}% of its original length:\n{}",
                    percentage, text
                ),
            ),
        };
        vec![ApiMessage::new(Role::System, system), ApiMessage::new(Role::User, user)]
    }
}

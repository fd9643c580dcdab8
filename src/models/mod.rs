pub mod grading;
pub mod question;
pub mod submission;
pub mod test_case;
pub mod violation;
pub mod question_result;

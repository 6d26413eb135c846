//! Jenkins job definition wrapping a pipeline script.

use askama::Template;

/// `config.xml` of a pipeline job. Both fields are XML-escaped on render.
#[derive(Template)]
#[template(path = "job_config.xml", escape = "html")]
pub struct JobConfig<'a> {
    pub description: &'a str,
    pub script: &'a str,
}

impl<'a> JobConfig<'a> {
    pub fn new(description: &'a str, script: &'a str) -> Self {
        Self { description, script }
    }
}

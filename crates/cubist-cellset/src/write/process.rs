//! Unbound procedure definitions and their execution

use cubist_http::Request;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::correlator::{ExecutionResult, ProcedureSection};
use crate::error::Result;
use crate::executor::CellsetExecutor;
use crate::tokenize::quote_literal;

/// Marker lines the server expects at the top of every section.
pub const GENERATED_HEADER: &str =
    "#****Begin: Generated Statements***\r\n#****End: Generated Statements****\r\n";

/// Lines taken by [`GENERATED_HEADER`]
pub const HEADER_LINES: u32 = 2;

pub const LINE_BREAK: &str = "\r\n";

/// Prefix `code` with the generated-statements header.
pub fn with_header(code: &str) -> String {
    format!("{}{}", GENERATED_HEADER, code)
}

/// Statement activating `sandbox`, or the base data when `None`.
pub fn sandbox_statement(sandbox: Option<&str>) -> String {
    match sandbox {
        Some(name) => format!(
            "ServerActiveSandboxSet({});SetUseActiveSandboxProperty(1);",
            quote_literal(name)
        ),
        None => "ServerActiveSandboxSet('');SetUseActiveSandboxProperty(0);".to_string(),
    }
}

/// Where a procedure reads its records from.
#[derive(Debug, Clone, PartialEq)]
pub enum DataSource {
    None,
    /// Comma separated, `"` quoted, no header record
    Ascii { file_name: String },
}

impl DataSource {
    fn body(&self) -> Value {
        match self {
            DataSource::None => json!({ "Type": "None" }),
            DataSource::Ascii { file_name } => json!({
                "Type": "ASCII",
                "asciiDecimalSeparator": ".",
                "asciiDelimiterChar": ",",
                "asciiDelimiterType": "Character",
                "asciiHeaderRecords": 0,
                "asciiQuoteCharacter": "\"",
                "asciiThousandSeparator": "",
                "dataSourceNameForClient": file_name,
                "dataSourceNameForServer": file_name,
            }),
        }
    }
}

/// A procedure that exists only for the duration of one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessDefinition {
    pub name: String,
    pub prolog: String,
    pub metadata: String,
    pub data: String,
    pub epilog: String,
    pub datasource: DataSource,
    /// String variables bound to the datasource columns, in order
    pub variables: Vec<String>,
}

impl ProcessDefinition {
    pub fn unbound(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prolog: String::new(),
            metadata: String::new(),
            data: String::new(),
            epilog: String::new(),
            datasource: DataSource::None,
            variables: Vec::new(),
        }
    }

    pub fn section(&self, section: ProcedureSection) -> &str {
        match section {
            ProcedureSection::Prolog => &self.prolog,
            ProcedureSection::Metadata => &self.metadata,
            ProcedureSection::Data => &self.data,
            ProcedureSection::Epilog => &self.epilog,
        }
    }

    /// JSON body of the process, with headers added to every section.
    pub fn body(&self) -> Value {
        let variables: Vec<Value> = self
            .variables
            .iter()
            .enumerate()
            .map(|(i, name)| {
                json!({
                    "Name": name,
                    "Type": "String",
                    "Position": i + 1,
                    "StartByte": 0,
                    "EndByte": 0,
                })
            })
            .collect();
        let ui_data: Vec<&str> = self
            .variables
            .iter()
            .map(|_| "VarType=32\u{c}ColType=827\u{c}")
            .collect();

        json!({
            "Name": self.name,
            "PrologProcedure": with_header(&self.prolog),
            "MetadataProcedure": with_header(&self.metadata),
            "DataProcedure": with_header(&self.data),
            "EpilogProcedure": with_header(&self.epilog),
            "HasSecurityAccess": false,
            "DataSource": self.datasource.body(),
            "Parameters": [],
            "Variables": variables,
            "VariablesUIData": ui_data,
        })
    }
}

/// Run `process` without storing it and return its structured status.
pub async fn execute_with_return(
    executor: &CellsetExecutor,
    process: &ProcessDefinition,
) -> Result<ExecutionResult> {
    debug!(process = %process.name, "executing unbound process");
    let request = Request::post("ExecuteProcessWithReturn")
        .query("$expand", "*")
        .json_value(json!({ "Process": process.body() }));
    let response = executor.send(request, "executing process").await?;
    let result = ExecutionResult::from_json(response.bytes())?;
    info!(
        process = %process.name,
        status = %result.status,
        log_file = result.log_file.as_deref().unwrap_or(""),
        "process finished"
    );
    Ok(result)
}

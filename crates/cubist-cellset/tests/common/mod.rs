//! In-memory cube server for integration tests
//!
//! Speaks just enough of the REST surface for the engine: cellsets,
//! unbound processes, error logs, file contents and dimension lookups.
//! Faults are switched on per test through [`Faults`].

#![allow(dead_code)]

use async_trait::async_trait;
use cubist_cellset::csv::parse_record;
use cubist_cellset::metadata::parse_unique_name;
use cubist_cellset::tokenize::{tokenize, Token};
use cubist_cellset::{CellValue, CellsetEngine, EngineConfig};
use cubist_http::{
    HttpError, HttpMethod, HttpResponse, HttpStatus, HttpResponseBuilder, HttpResult, Request, RequestBody,
    SessionContext, Transport,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const LINE_BREAK: &str = "\r\n";

/// `Updateable` masks reported for writable and read-only cells
const UPDATEABLE: u64 = 0x2;
const NOT_UPDATEABLE: u64 = (1 << 28) | 0x2;

type Reply = Result<HttpResponse, (u16, String)>;

/// One axis of a registered query, fastest axis first.
#[derive(Debug, Clone)]
pub struct AxisDef {
    pub dimensions: Vec<String>,
    pub tuples: Vec<Vec<String>>,
}

impl AxisDef {
    pub fn single(dimension: &str, elements: &[&str]) -> Self {
        Self {
            dimensions: vec![dimension.to_string()],
            tuples: elements.iter().map(|e| vec![e.to_string()]).collect(),
        }
    }
}

#[derive(Debug, Clone)]
struct QueryDef {
    cube: String,
    axes: Vec<AxisDef>,
}

#[derive(Debug, Clone, Default)]
struct CubeDef {
    dimensions: Vec<String>,
    values: HashMap<Vec<String>, CellValue>,
}

#[derive(Debug)]
struct LiveCellset {
    cube: String,
    axes: Vec<AxisDef>,
    coordinates: Vec<Vec<String>>,
}

#[derive(Debug, Default)]
struct UploadState {
    root: String,
    name: String,
    arrivals: usize,
    parts: HashMap<String, Vec<u8>>,
}

/// A finished multipart upload.
#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub name: String,
    pub content: Vec<u8>,
    /// Part numbers in the order the completing call listed them
    pub part_numbers: Vec<u64>,
    /// Part numbers in the order their uploads finished
    pub finish_order: Vec<u64>,
}

/// Injected misbehaviour.
#[derive(Debug, Default)]
pub struct Faults {
    /// Every partition fetch sleeps this long
    pub partition_delay: Duration,
    /// Partitions starting at this ordinal answer 500
    pub fail_partition_at: Option<u64>,
    /// This cell update call (0-based) answers 500
    pub fail_patch_call: Option<usize>,
    /// The part arriving at this position (0-based) answers 500
    pub fail_part_arrival: Option<usize>,
    /// Single-request content uploads answer 500
    pub fail_content_put: bool,
    /// Delay of each part upload by arrival position, in milliseconds
    pub part_delays_ms: Vec<u64>,
    /// This process call (0-based) answers 500
    pub fail_process_call: Option<usize>,
    /// Status reported by a process call instead of running it
    pub forced_status: HashMap<usize, String>,
    /// Log line written along with a forced status
    pub forced_log_line: Option<String>,
    /// Log fetches answering 404 before logs become visible
    pub hidden_log_polls: u32,
    pub logs_never_visible: bool,
}

#[derive(Default)]
struct State {
    cubes: HashMap<String, CubeDef>,
    elements: HashMap<String, Vec<String>>,
    string_measures: HashSet<String>,
    sandbox_dimension: bool,
    /// Children of each consolidated element, by dimension
    consolidations: HashMap<String, HashMap<String, Vec<String>>>,
    read_only: HashSet<(String, Vec<String>)>,
    queries: HashMap<String, QueryDef>,
    views: HashMap<(String, String), QueryDef>,
    cellsets: HashMap<String, LiveCellset>,
    next_id: usize,
    deleted_cellsets: Vec<String>,
    in_flight_at_delete: Vec<usize>,
    events: Vec<String>,
    files: HashMap<(String, String), Vec<u8>>,
    uploads: HashMap<String, UploadState>,
    finished_parts: HashMap<String, Vec<u64>>,
    completed_uploads: Vec<CompletedUpload>,
    logs: HashMap<String, String>,
    log_polls: usize,
    processes: Vec<Value>,
    patch_calls: usize,
    partitions: Vec<(u64, u64)>,
    faults: Faults,
}

/// The fake server; share it as `Arc<FakeServer>`.
pub struct FakeServer {
    version: String,
    state: Mutex<State>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeServer {
    pub fn new(version: &str) -> Arc<Self> {
        Arc::new(Self {
            version: version.to_string(),
            state: Mutex::new(State::default()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn session(&self) -> SessionContext {
        SessionContext::new().with_version(self.version.clone())
    }

    pub fn engine(self: &Arc<Self>, config: EngineConfig) -> CellsetEngine {
        let transport: Arc<dyn Transport> = self.clone();
        CellsetEngine::new(transport, self.session(), config)
    }

    pub fn cube(&self, name: &str, dimensions: &[&str]) {
        self.lock().cubes.insert(
            name.to_string(),
            CubeDef {
                dimensions: dimensions.iter().map(|d| d.to_string()).collect(),
                values: HashMap::new(),
            },
        );
    }

    /// Restrict `dimension` to `elements`; unrestricted dimensions accept any name.
    pub fn elements(&self, dimension: &str, elements: &[&str]) {
        self.lock().elements.insert(
            dimension.to_string(),
            elements.iter().map(|e| e.to_string()).collect(),
        );
    }

    pub fn string_measures(&self, measures: &[&str]) {
        self.lock()
            .string_measures
            .extend(measures.iter().map(|m| m.to_string()));
    }

    /// Make `parent` a consolidation of `children` in `dimension`.
    pub fn consolidated(&self, dimension: &str, parent: &str, children: &[&str]) {
        self.lock()
            .consolidations
            .entry(dimension.to_string())
            .or_default()
            .insert(parent.to_string(), children.iter().map(|c| c.to_string()).collect());
    }

    /// Mark one leaf cell as not updateable.
    pub fn read_only(&self, cube: &str, elements: &[&str]) {
        self.lock().read_only.insert((
            cube.to_string(),
            elements.iter().map(|e| e.to_string()).collect(),
        ));
    }

    /// Report a leading sandbox dimension on every cube.
    pub fn sandbox_dimension(&self) {
        self.lock().sandbox_dimension = true;
    }

    pub fn query(&self, mdx: &str, cube: &str, axes: Vec<AxisDef>) {
        self.lock().queries.insert(
            mdx.to_string(),
            QueryDef {
                cube: cube.to_string(),
                axes,
            },
        );
    }

    pub fn view(&self, cube: &str, view: &str, axes: Vec<AxisDef>) {
        self.lock().views.insert(
            (cube.to_string(), view.to_string()),
            QueryDef {
                cube: cube.to_string(),
                axes,
            },
        );
    }

    pub fn set(&self, cube: &str, elements: &[&str], value: impl Into<CellValue>) {
        let mut state = self.lock();
        if let Some(def) = state.cubes.get_mut(cube) {
            def.values
                .insert(elements.iter().map(|e| e.to_string()).collect(), value.into());
        }
    }

    pub fn value(&self, cube: &str, elements: &[&str]) -> Option<CellValue> {
        let key: Vec<String> = elements.iter().map(|e| e.to_string()).collect();
        self.lock()
            .cubes
            .get(cube)
            .and_then(|def| def.values.get(&key).cloned())
    }

    pub fn faults(&self, configure: impl FnOnce(&mut Faults)) {
        configure(&mut self.lock().faults);
    }

    pub fn live_cellsets(&self) -> usize {
        self.lock().cellsets.len()
    }

    pub fn deleted_cellsets(&self) -> Vec<String> {
        self.lock().deleted_cellsets.clone()
    }

    /// Partition fetches still running at each cellset delete.
    pub fn in_flight_at_delete(&self) -> Vec<usize> {
        self.lock().in_flight_at_delete.clone()
    }

    /// `(begin, end)` of every partition fetch, both inclusive, sorted.
    pub fn partitions(&self) -> Vec<(u64, u64)> {
        let mut partitions = self.lock().partitions.clone();
        partitions.sort();
        partitions
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn processes(&self) -> Vec<Value> {
        self.lock().processes.clone()
    }

    pub fn log_polls(&self) -> usize {
        self.lock().log_polls
    }

    /// `METHOD path` of every request, in arrival order.
    pub fn events(&self) -> Vec<String> {
        self.lock().events.clone()
    }

    pub fn completed_uploads(&self) -> Vec<CompletedUpload> {
        self.lock().completed_uploads.clone()
    }

    /// `(root, name)` of every stored file.
    pub fn files(&self) -> Vec<(String, String)> {
        self.lock().files.keys().cloned().collect()
    }

    async fn route(&self, request: &Request) -> Reply {
        let path = request.path.as_str();
        match request.method {
            HttpMethod::Get if path == "Configuration/ProductVersion/$value" => {
                Ok(text_reply(&self.version))
            }
            HttpMethod::Post if path == "ExecuteMDX" => self.execute_mdx(request),
            HttpMethod::Post if path.ends_with("/tm1.Execute") => self.execute_view(path),
            HttpMethod::Get if path.starts_with("Cellsets(") && path.contains("/tm1.GetPartition(") => {
                self.partition(path, request).await
            }
            HttpMethod::Get if path.starts_with("Cellsets(") => self.cellset(path, request),
            HttpMethod::Patch if path.starts_with("Cellsets(") => self.patch_cells(path, request),
            HttpMethod::Delete if path.starts_with("Cellsets(") => self.delete_cellset(path),
            HttpMethod::Post if path == "ExecuteProcessWithReturn" => self.run_process(request),
            HttpMethod::Get if path.starts_with("ErrorLogFiles(") => self.error_log(path),
            HttpMethod::Get if path.starts_with("Cubes(") && path.ends_with("/Dimensions") => {
                self.cube_dimensions(path)
            }
            HttpMethod::Get if path.starts_with("Dimensions(") => self.dimension(path),
            _ if path.starts_with("Contents(") => self.contents(request).await,
            _ => Err((404, format!("no route for {} {}", request.method, path))),
        }
    }

    fn execute_mdx(&self, request: &Request) -> Reply {
        let mdx = body_json(request)["MDX"].as_str().unwrap_or_default().to_string();
        let mut state = self.lock();
        let query = match state.queries.get(&mdx) {
            Some(query) => query.clone(),
            None => parse_write_mdx(&mdx).ok_or((400, format!("cannot execute '{}'", mdx)))?,
        };
        state.create_cellset(query)
    }

    fn execute_view(&self, path: &str) -> Reply {
        let keys = keys(path);
        let (cube, view) = match keys.as_slice() {
            [cube, view] => (cube.clone(), view.clone()),
            _ => return Err((400, format!("bad view path {}", path))),
        };
        let mut state = self.lock();
        let query = state
            .views
            .get(&(cube.clone(), view.clone()))
            .cloned()
            .ok_or((404, format!("view '{}' not found in cube '{}'", view, cube)))?;
        state.create_cellset(query)
    }

    fn cellset(&self, path: &str, request: &Request) -> Reply {
        let id = first_key(path);
        let state = self.lock();
        let live = state
            .cellsets
            .get(&id)
            .ok_or((404, format!("cellset '{}' not found", id)))?;
        let expand = request.query_value("$expand").unwrap_or_default();
        if expand == "Axes($select=Cardinality)" {
            let axes: Vec<Value> = live
                .axes
                .iter()
                .map(|a| json!({ "Cardinality": a.tuples.len() }))
                .collect();
            return Ok(json_reply(200, json!({ "Axes": axes })));
        }

        let cube_dimensions: Vec<Value> = state.cubes[&live.cube]
            .dimensions
            .iter()
            .map(|d| json!({ "Name": d }))
            .collect();
        let axes: Vec<Value> = live
            .axes
            .iter()
            .enumerate()
            .map(|(i, axis)| {
                let hierarchies: Vec<Value> = axis
                    .dimensions
                    .iter()
                    .map(|d| json!({ "Name": d, "Dimension": { "Name": d } }))
                    .collect();
                let tuples: Vec<Value> = axis
                    .tuples
                    .iter()
                    .map(|tuple| {
                        let members: Vec<Value> = axis
                            .dimensions
                            .iter()
                            .zip(tuple)
                            .map(|(d, e)| json!({ "Name": e, "UniqueName": unique_name(d, e) }))
                            .collect();
                        json!({ "Members": members })
                    })
                    .collect();
                json!({
                    "Ordinal": i,
                    "Cardinality": axis.tuples.len(),
                    "Hierarchies": hierarchies,
                    "Tuples": tuples,
                })
            })
            .collect();

        let mut body = json!({
            "ID": id,
            "Cube": { "Name": live.cube, "Dimensions": cube_dimensions },
            "Axes": axes,
        });
        if expand.contains("Cells(") {
            let updateable = expand.contains("Updateable");
            body["Cells"] = Value::Array(state.cells(live, 0, live.coordinates.len(), updateable));
        }
        Ok(json_reply(200, body))
    }

    async fn partition(&self, path: &str, request: &Request) -> Reply {
        let id = first_key(path);
        let updateable = request
            .query_value("$select")
            .is_some_and(|select| select.split(',').any(|f| f == "Updateable"));
        let (begin, end) = match (number_after(path, "Begin="), number_after(path, "End=")) {
            (Some(begin), Some(end)) => (begin, end),
            _ => return Err((400, format!("bad partition path {}", path))),
        };
        let (delay, fail) = {
            let mut state = self.lock();
            state.partitions.push((begin, end));
            (
                state.faults.partition_delay,
                state.faults.fail_partition_at == Some(begin),
            )
        };

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if fail {
            return Err((500, format!("partition {}..{} failed", begin, end)));
        }
        let state = self.lock();
        let live = state
            .cellsets
            .get(&id)
            .ok_or((404, format!("cellset '{}' not found", id)))?;
        let cells = state.cells(live, begin as usize, end as usize + 1, updateable);
        Ok(json_reply(200, json!({ "value": cells })))
    }

    fn patch_cells(&self, path: &str, request: &Request) -> Reply {
        let id = first_key(path);
        let mut state = self.lock();
        let call = state.patch_calls;
        state.patch_calls += 1;
        if state.faults.fail_patch_call == Some(call) {
            return Err((500, "cell update rejected".to_string()));
        }
        let (cube, coordinates) = {
            let live = state
                .cellsets
                .get(&id)
                .ok_or((404, format!("cellset '{}' not found", id)))?;
            (live.cube.clone(), live.coordinates.clone())
        };
        let updates = body_json(request).as_array().cloned().unwrap_or_default();
        let mut writes = Vec::with_capacity(updates.len());
        for update in updates {
            let ordinal = update["Ordinal"].as_u64().unwrap_or(u64::MAX) as usize;
            let coordinate = coordinates
                .get(ordinal)
                .cloned()
                .ok_or((400, format!("ordinal {} out of range", ordinal)))?;
            if !state.is_updateable(&cube, &coordinate) {
                return Err((400, format!("cell at ordinal {} is not updateable", ordinal)));
            }
            let value: CellValue = serde_json::from_value(update["Value"].clone()).unwrap_or_default();
            writes.push((coordinate, value));
        }
        // A chunk applies as a whole or not at all
        if let Some(def) = state.cubes.get_mut(&cube) {
            def.values.extend(writes);
        }
        Ok(HttpResponseBuilder::new().status_code(204).build())
    }

    fn delete_cellset(&self, path: &str) -> Reply {
        let id = first_key(path);
        let running = self.in_flight.load(Ordering::SeqCst);
        let mut state = self.lock();
        state
            .cellsets
            .remove(&id)
            .ok_or((404, format!("cellset '{}' not found", id)))?;
        state.deleted_cellsets.push(id);
        state.in_flight_at_delete.push(running);
        Ok(HttpResponseBuilder::new().status_code(204).build())
    }

    fn run_process(&self, request: &Request) -> Reply {
        let process = body_json(request)["Process"].clone();
        let mut state = self.lock();
        let call = state.processes.len();
        state.processes.push(process.clone());
        if state.faults.fail_process_call == Some(call) {
            return Err((500, "process execution failed".to_string()));
        }

        let name = process["Name"].as_str().unwrap_or_default().to_string();
        let (status, errors) = match state.faults.forced_status.get(&call).cloned() {
            Some(status) => {
                let line = state
                    .faults
                    .forced_log_line
                    .clone()
                    .unwrap_or_else(|| "Prolog procedure line (4): Process aborted by the server".to_string());
                (status, vec![line])
            }
            None => {
                let errors = state.interpret(&process);
                let status = if errors.is_empty() {
                    "CompletedSuccessfully"
                } else {
                    "HasMinorErrors"
                };
                (status.to_string(), errors)
            }
        };

        let log_file = if errors.is_empty() {
            Value::Null
        } else {
            let file = format!("TM1ProcessError_{}_{}.log", call, name.trim_start_matches('}'));
            state.logs.insert(file.clone(), errors.join(LINE_BREAK));
            json!({ "Filename": file })
        };
        Ok(json_reply(
            201,
            json!({ "ProcessExecuteStatusCode": status, "ErrorLogFile": log_file }),
        ))
    }

    fn error_log(&self, path: &str) -> Reply {
        let name = first_key(path);
        let mut state = self.lock();
        state.log_polls += 1;
        let missing = (404, format!("error log '{}' not found", name));
        if state.faults.logs_never_visible {
            return Err(missing);
        }
        if state.faults.hidden_log_polls > 0 {
            state.faults.hidden_log_polls -= 1;
            return Err(missing);
        }
        state.logs.get(&name).map(|t| text_reply(t)).ok_or(missing)
    }

    fn cube_dimensions(&self, path: &str) -> Reply {
        let cube = first_key(path);
        let state = self.lock();
        let def = state
            .cubes
            .get(&cube)
            .ok_or((404, format!("cube '{}' not found", cube)))?;
        let mut names: Vec<Value> = def.dimensions.iter().map(|d| json!({ "Name": d })).collect();
        if state.sandbox_dimension {
            names.insert(0, json!({ "Name": "Sandboxes" }));
        }
        Ok(json_reply(200, json!({ "value": names })))
    }

    fn dimension(&self, path: &str) -> Reply {
        let dimension = first_key(path);
        let state = self.lock();
        let elements: Vec<Value> = state
            .elements
            .get(&dimension)
            .map(|elements| {
                elements
                    .iter()
                    .map(|e| {
                        let kind = if state.string_measures.contains(e) {
                            "String"
                        } else {
                            "Numeric"
                        };
                        json!({ "Name": e, "Type": kind })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(json_reply(200, json!({ "Hierarchies": [{ "Elements": elements }] })))
    }

    async fn contents(&self, request: &Request) -> Reply {
        let path = request.path.as_str();
        let keys = keys(path);
        match request.method {
            HttpMethod::Post if path.ends_with("/mpu.CreateMultipartUpload") => {
                let mut state = self.lock();
                let id = format!("upload-{}", state.uploads.len() + 1);
                state.uploads.insert(
                    id.clone(),
                    UploadState {
                        root: keys[0].clone(),
                        name: keys[1].clone(),
                        ..Default::default()
                    },
                );
                Ok(json_reply(201, json!({ "UploadID": id })))
            }
            HttpMethod::Post if path.ends_with("/Parts") => self.upload_part(&keys[2], request).await,
            HttpMethod::Post if path.ends_with("/mpu.Complete") => {
                self.complete_upload(&keys[2], request)
            }
            HttpMethod::Post if path.ends_with("/Contents") => {
                let name = body_json(request)["Name"].as_str().unwrap_or_default().to_string();
                self.lock().files.insert((keys[0].clone(), name), Vec::new());
                Ok(HttpResponseBuilder::new().status_code(201).build())
            }
            HttpMethod::Put if path.ends_with("/Content") => {
                let mut state = self.lock();
                let key = (keys[0].clone(), keys[1].clone());
                if !state.files.contains_key(&key) {
                    return Err((404, format!("file '{}' not found", key.1)));
                }
                if state.faults.fail_content_put {
                    return Err((500, format!("content of '{}' rejected", key.1)));
                }
                state.files.insert(key, body_bytes(request));
                Ok(HttpResponseBuilder::new().status_code(204).build())
            }
            HttpMethod::Delete => {
                let mut state = self.lock();
                state
                    .files
                    .remove(&(keys[0].clone(), keys[1].clone()))
                    .ok_or((404, format!("file '{}' not found", keys[1])))?;
                Ok(HttpResponseBuilder::new().status_code(204).build())
            }
            _ => Err((404, format!("no route for {} {}", request.method, path))),
        }
    }

    async fn upload_part(&self, upload_id: &str, request: &Request) -> Reply {
        let (arrival, delay, fail) = {
            let mut state = self.lock();
            let arrival = match state.uploads.get_mut(upload_id) {
                Some(upload) => {
                    upload.arrivals += 1;
                    upload.arrivals - 1
                }
                None => return Err((404, format!("upload '{}' not found", upload_id))),
            };
            let delay = state.faults.part_delays_ms.get(arrival).copied().unwrap_or(0);
            (arrival, delay, state.faults.fail_part_arrival == Some(arrival))
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        if fail {
            return Err((500, format!("part {} rejected", arrival)));
        }

        let part_number = arrival as u64 + 1;
        let etag = format!("etag-{}", part_number);
        let mut state = self.lock();
        if let Some(upload) = state.uploads.get_mut(upload_id) {
            upload.parts.insert(etag.clone(), body_bytes(request));
        }
        state
            .finished_parts
            .entry(upload_id.to_string())
            .or_default()
            .push(part_number);
        Ok(json_reply(
            201,
            json!({ "PartNumber": part_number, "@odata.etag": etag }),
        ))
    }

    fn complete_upload(&self, upload_id: &str, request: &Request) -> Reply {
        let mut state = self.lock();
        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or((404, format!("upload '{}' not found", upload_id)))?;
        let parts = body_json(request)["Parts"].as_array().cloned().unwrap_or_default();
        let mut content = Vec::new();
        let mut part_numbers = Vec::new();
        for part in parts {
            let etag = part["ETag"].as_str().unwrap_or_default();
            let data = upload
                .parts
                .get(etag)
                .ok_or((400, format!("unknown part '{}'", etag)))?;
            content.extend_from_slice(data);
            part_numbers.push(part["PartNumber"].as_u64().unwrap_or(0));
        }
        let finish_order = state.finished_parts.remove(upload_id).unwrap_or_default();
        state.completed_uploads.push(CompletedUpload {
            name: upload.name.clone(),
            content: content.clone(),
            part_numbers,
            finish_order,
        });
        state.files.insert((upload.root, upload.name), content);
        Ok(HttpResponseBuilder::new().status_code(204).build())
    }
}

#[async_trait]
impl Transport for FakeServer {
    async fn execute(&self, request: Request) -> HttpResult<HttpResponse> {
        self.lock()
            .events
            .push(format!("{} {}", request.method, request.path));
        self.route(&request)
            .await
            .map_err(|(status, body)| HttpError::Status {
                status: HttpStatus::from(status),
                method: request.method,
                path: request.path.clone(),
                body,
            })
    }
}

impl State {
    fn create_cellset(&mut self, query: QueryDef) -> Reply {
        let cube = self
            .cubes
            .get(&query.cube)
            .ok_or((404, format!("cube '{}' not found", query.cube)))?;
        let cardinality: usize = query.axes.iter().map(|a| a.tuples.len()).product();
        let mut coordinates = Vec::with_capacity(cardinality);
        for ordinal in 0..cardinality {
            let mut rest = ordinal;
            let mut pairs: Vec<(&String, &String)> = Vec::new();
            for axis in &query.axes {
                let n = axis.tuples.len();
                pairs.extend(axis.dimensions.iter().zip(&axis.tuples[rest % n]));
                rest /= n;
            }
            let coordinate = cube
                .dimensions
                .iter()
                .map(|d| {
                    pairs
                        .iter()
                        .find(|(dimension, _)| *dimension == d)
                        .map(|(_, element)| (*element).clone())
                        .ok_or((400, format!("query does not address dimension '{}'", d)))
                })
                .collect::<Result<Vec<String>, _>>()?;
            coordinates.push(coordinate);
        }

        self.next_id += 1;
        let id = format!("cs-{}", self.next_id);
        self.cellsets.insert(
            id.clone(),
            LiveCellset {
                cube: query.cube,
                axes: query.axes,
                coordinates,
            },
        );
        Ok(json_reply(201, json!({ "ID": id })))
    }

    /// Position and children of the first consolidated element of `coordinate`.
    fn consolidation(&self, cube: &str, coordinate: &[String]) -> Option<(usize, Vec<String>)> {
        let def = self.cubes.get(cube)?;
        def.dimensions
            .iter()
            .zip(coordinate)
            .enumerate()
            .find_map(|(i, (d, e))| Some((i, self.consolidations.get(d)?.get(e)?.clone())))
    }

    fn is_read_only(&self, cube: &str, coordinate: &[String]) -> bool {
        self.read_only.contains(&(cube.to_string(), coordinate.to_vec()))
    }

    /// Consolidated cells only take spreads.
    fn is_updateable(&self, cube: &str, coordinate: &[String]) -> bool {
        !self.is_read_only(cube, coordinate) && self.consolidation(cube, coordinate).is_none()
    }

    fn cell_value(&self, cube: &str, coordinate: &[String]) -> CellValue {
        if let Some((i, children)) = self.consolidation(cube, coordinate) {
            let total = children
                .iter()
                .map(|child| {
                    let mut leaf = coordinate.to_vec();
                    leaf[i] = child.clone();
                    self.cell_value(cube, &leaf).as_number().unwrap_or(0.0)
                })
                .sum();
            return CellValue::Number(total);
        }
        let stored = self
            .cubes
            .get(cube)
            .and_then(|def| def.values.get(coordinate).cloned());
        match stored {
            Some(value) => value,
            None if coordinate
                .last()
                .is_some_and(|m| self.string_measures.contains(m)) =>
            {
                CellValue::Text(String::new())
            }
            None => CellValue::Number(0.0),
        }
    }

    fn cells(&self, live: &LiveCellset, start: usize, end: usize, updateable: bool) -> Vec<Value> {
        (start..end.min(live.coordinates.len()))
            .map(|ordinal| {
                let coordinate = &live.coordinates[ordinal];
                let value = self.cell_value(&live.cube, coordinate);
                let mut cell = json!({ "Ordinal": ordinal, "Value": value });
                if updateable {
                    cell["Updateable"] = if self.is_updateable(&live.cube, coordinate) {
                        json!(UPDATEABLE)
                    } else {
                        json!(NOT_UPDATEABLE)
                    };
                }
                cell
            })
            .collect()
    }

    fn interpret(&mut self, process: &Value) -> Vec<String> {
        let code = |key: &str| process[key].as_str().unwrap_or_default().to_string();
        let mut errors = self.run_section("Prolog", &code("PrologProcedure"));
        if process["DataSource"]["Type"] == "ASCII" {
            let source = process["DataSource"]["dataSourceNameForServer"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            errors.extend(self.load_file(&source, &code("DataProcedure")));
        }
        errors.extend(self.run_section("Epilog", &code("EpilogProcedure")));
        errors
    }

    fn run_section(&mut self, section: &str, code: &str) -> Vec<String> {
        let mut errors = Vec::new();
        for (i, line) in code.split(LINE_BREAK).enumerate() {
            if let Err(message) = self.run_line(line) {
                errors.push(format!("{} procedure line ({}): {}", section, i + 1, message));
            }
        }
        errors
    }

    /// Run the first cell write found on `line`.
    fn run_line(&mut self, line: &str) -> Result<(), String> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }
        let tokens = tokenize(line).map_err(|e| e.to_string())?;
        for i in 0..tokens.len() {
            let Token::Word(word) = &tokens[i] else {
                continue;
            };
            match word.as_str() {
                "ViewZeroOut" => {
                    if let Some(cube) = parse_call(&tokens[i..]).and_then(|(c, _)| c.literal(0).map(str::to_string)) {
                        self.zero_out(&cube);
                    }
                }
                "CellIsUpdateable" => {
                    let (call, _) = parse_call(&tokens[i..]).ok_or("syntax error")?;
                    let (cube, elements) = call.address(0)?;
                    if self.is_read_only(&cube, &elements) {
                        return Ok(());
                    }
                }
                "CellPutProportionalSpread" => {
                    let (call, _) = parse_call(&tokens[i..]).ok_or("syntax error")?;
                    let (cube, elements) = call.address(1)?;
                    if self.consolidation(&cube, &elements).is_some() {
                        let amount = call
                            .word(0)
                            .and_then(|w| w.parse().ok())
                            .ok_or("value must be a number")?;
                        return self.spread(&cube, &elements, amount);
                    }
                }
                "CellPutN" | "CellIncrementN" | "CellPutS" => {
                    let (call, _) = parse_call(&tokens[i..]).ok_or("syntax error")?;
                    return self.put(&call);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn zero_out(&mut self, cube: &str) {
        if let Some(def) = self.cubes.get_mut(cube) {
            def.values.clear();
        }
    }

    /// Distribute `amount` over the leaves below `elements`, in proportion
    /// to their current values or evenly when they sum to zero.
    fn spread(&mut self, cube: &str, elements: &[String], amount: f64) -> Result<(), String> {
        let Some((i, children)) = self.consolidation(cube, elements) else {
            return self.write_cell(cube, elements.to_vec(), CellValue::Number(amount), false);
        };
        let leaves: Vec<Vec<String>> = children
            .iter()
            .map(|child| {
                let mut leaf = elements.to_vec();
                leaf[i] = child.clone();
                leaf
            })
            .collect();
        let current: Vec<f64> = leaves
            .iter()
            .map(|leaf| self.cell_value(cube, leaf).as_number().unwrap_or(0.0))
            .collect();
        let total: f64 = current.iter().sum();
        for (leaf, value) in leaves.into_iter().zip(current) {
            let share = if total == 0.0 {
                amount / children.len() as f64
            } else {
                amount * value / total
            };
            self.spread(cube, &leaf, share)?;
        }
        Ok(())
    }

    fn put(&mut self, call: &Call) -> Result<(), String> {
        let (cube, elements) = call.address(1)?;
        let value = match call.function.as_str() {
            "CellPutS" => CellValue::Text(call.literal(0).ok_or("value must be a literal")?.to_string()),
            _ => CellValue::Number(
                call.word(0)
                    .and_then(|w| w.parse().ok())
                    .ok_or("value must be a number")?,
            ),
        };
        self.write_cell(&cube, elements, value, call.function == "CellIncrementN")
    }

    fn write_cell(
        &mut self,
        cube: &str,
        elements: Vec<String>,
        value: CellValue,
        increment: bool,
    ) -> Result<(), String> {
        let dimensions = self
            .cubes
            .get(cube)
            .ok_or_else(|| format!("Cube \"{}\" not found", cube))?
            .dimensions
            .clone();
        if dimensions.len() != elements.len() {
            return Err(format!(
                "Cube \"{}\" has {} dimensions, got {} elements",
                cube,
                dimensions.len(),
                elements.len()
            ));
        }
        for (d, e) in dimensions.iter().zip(&elements) {
            let consolidated = self.consolidations.get(d).is_some_and(|c| c.contains_key(e));
            if let Some(known) = self.elements.get(d) {
                if !consolidated && !known.iter().any(|k| k == e) {
                    return Err(format!("Element \"{}\" not found in dimension \"{}\"", e, d));
                }
            }
        }
        if self.consolidation(cube, &elements).is_some() {
            return Err("Cannot write to a consolidated cell".to_string());
        }
        if self.is_read_only(cube, &elements) {
            return Err("Cell is not updateable".to_string());
        }
        let string_cell = elements
            .last()
            .is_some_and(|m| self.string_measures.contains(m));
        match (&value, string_cell) {
            (CellValue::Text(_), false) => {
                return Err("Data type mismatch: string written to a numeric cell".to_string())
            }
            (CellValue::Number(_), true) => {
                return Err("Data type mismatch: number written to a string cell".to_string())
            }
            _ => {}
        }

        let Some(def) = self.cubes.get_mut(cube) else {
            return Err(format!("Cube \"{}\" not found", cube));
        };
        let value = match (increment, value) {
            (true, CellValue::Number(n)) => CellValue::Number(
                def.values
                    .get(&elements)
                    .and_then(CellValue::as_number)
                    .unwrap_or(0.0)
                    + n,
            ),
            (_, value) => value,
        };
        def.values.insert(elements, value);
        Ok(())
    }

    /// Ingest an uploaded CSV file the way a generated load procedure does.
    fn load_file(&mut self, source: &str, data: &str) -> Vec<String> {
        let content = self
            .files
            .iter()
            .find(|((_, name), _)| name == source || source.strip_suffix(".blb") == Some(name.as_str()))
            .map(|(_, content)| content.clone());
        let Some(content) = content else {
            return vec![format!(
                "Prolog procedure line (3): Unable to open data source \"{}\"",
                source
            )];
        };

        let data_line = data
            .split(LINE_BREAK)
            .position(|l| l.contains("CellPutS("))
            .map_or(1, |i| i + 1);
        let cube = tokenize(data)
            .ok()
            .and_then(|tokens| {
                let start = tokens
                    .iter()
                    .position(|t| *t == Token::Word("CellPutS".to_string()))?;
                parse_call(&tokens[start..]).and_then(|(c, _)| c.literal(1).map(str::to_string))
            })
            .unwrap_or_default();
        let increment = data.contains("CellIncrementN(");
        let guarded = data.contains("CellIsUpdateable(");
        let spread = data.contains("CellPutProportionalSpread(");

        let text = String::from_utf8_lossy(&content).into_owned();
        let mut errors = Vec::new();
        for record in text.split(LINE_BREAK).filter(|l| !l.is_empty()) {
            let fail = |message: String| format!("{},Data procedure line ({}): {}", record, data_line, message);
            let Some(mut fields) = parse_record(record) else {
                errors.push(fail("Unable to parse record".to_string()));
                continue;
            };
            let Some(raw) = fields.pop() else {
                continue;
            };
            let string_cell = fields
                .last()
                .is_some_and(|m| self.string_measures.contains(m));
            let value = if string_cell {
                CellValue::Text(raw)
            } else {
                match raw.parse::<f64>() {
                    Ok(n) => CellValue::Number(n),
                    Err(_) => {
                        errors.push(fail(format!("Cannot convert \"{}\" to a number", raw)));
                        continue;
                    }
                }
            };
            if guarded && self.is_read_only(&cube, &fields) {
                continue;
            }
            let written = match value {
                CellValue::Number(n) if spread && self.consolidation(&cube, &fields).is_some() => {
                    self.spread(&cube, &fields, n)
                }
                value => self.write_cell(&cube, fields, value, increment),
            };
            if let Err(message) = written {
                errors.push(fail(message));
            }
        }
        errors
    }
}

/// A function call: its name and the tokens of each argument.
#[derive(Debug, Clone, PartialEq)]
struct Call {
    function: String,
    args: Vec<Vec<Token>>,
}

impl Call {
    /// Argument `i` when it is a single quoted literal.
    fn literal(&self, i: usize) -> Option<&str> {
        match self.args.get(i)?.as_slice() {
            [Token::Literal(text)] => Some(text),
            _ => None,
        }
    }

    /// Argument `i` when it is bare words, joined.
    fn word(&self, i: usize) -> Option<String> {
        let arg = self.args.get(i)?;
        if arg.is_empty() {
            return None;
        }
        arg.iter()
            .map(|t| match t {
                Token::Word(w) => Some(w.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Cube and elements given as literals from argument `i` onward.
    fn address(&self, i: usize) -> Result<(String, Vec<String>), String> {
        let cube = self.literal(i).ok_or("cube name must be a literal")?.to_string();
        let elements = (i + 1..self.args.len())
            .map(|j| {
                self.literal(j)
                    .map(str::to_string)
                    .ok_or_else(|| "element must be a literal".to_string())
            })
            .collect::<Result<Vec<String>, String>>()?;
        Ok((cube, elements))
    }
}

/// Parse the call starting at `tokens[0]`; returns it with the tokens consumed.
fn parse_call(tokens: &[Token]) -> Option<(Call, usize)> {
    let Some(Token::Word(function)) = tokens.first() else {
        return None;
    };
    if tokens.get(1) != Some(&Token::OpenParen) {
        return None;
    }
    let mut args = Vec::new();
    let mut current = Vec::new();
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(2) {
        match token {
            Token::OpenParen => {
                depth += 1;
                current.push(token.clone());
            }
            Token::CloseParen if depth == 0 => {
                if !current.is_empty() || !args.is_empty() {
                    args.push(current);
                }
                let call = Call {
                    function: function.clone(),
                    args,
                };
                return Some((call, i + 1));
            }
            Token::CloseParen => {
                depth -= 1;
                current.push(token.clone());
            }
            Token::Comma if depth == 0 => args.push(std::mem::take(&mut current)),
            token => current.push(token.clone()),
        }
    }
    None
}

/// Parse `SELECT {(m,...),...} ON 0 FROM [cube]` into a one-axis query.
fn parse_write_mdx(mdx: &str) -> Option<QueryDef> {
    const FROM: &str = "} ON 0 FROM [";
    let body = mdx.strip_prefix("SELECT {")?;
    let split = body.rfind(FROM)?;
    let cube = body[split + FROM.len()..].strip_suffix(']')?.replace("]]", "]");

    let mut dimensions = Vec::new();
    let mut tuples = Vec::new();
    for members in split_tuples(&body[..split]) {
        let mut tuple = Vec::with_capacity(members.len());
        let mut tuple_dimensions = Vec::with_capacity(members.len());
        for member in members {
            let segments = parse_unique_name(&member).ok()?;
            tuple_dimensions.push(segments.first()?.clone());
            tuple.push(segments.last()?.clone());
        }
        dimensions = tuple_dimensions;
        tuples.push(tuple);
    }
    Some(QueryDef {
        cube,
        axes: vec![AxisDef { dimensions, tuples }],
    })
}

/// Members of each `(...)` tuple, brackets respected.
fn split_tuples(set: &str) -> Vec<Vec<String>> {
    let mut tuples = Vec::new();
    let mut members = Vec::new();
    let mut current = String::new();
    let mut in_bracket = false;
    let mut chars = set.chars().peekable();
    while let Some(c) = chars.next() {
        if in_bracket {
            current.push(c);
            if c == ']' {
                if chars.peek() == Some(&']') {
                    current.push(']');
                    chars.next();
                } else {
                    in_bracket = false;
                }
            }
            continue;
        }
        match c {
            '[' => {
                in_bracket = true;
                current.push(c);
            }
            '(' => {}
            ',' if !current.is_empty() => members.push(std::mem::take(&mut current)),
            ',' => {}
            ')' => {
                members.push(std::mem::take(&mut current));
                tuples.push(std::mem::take(&mut members));
            }
            c => current.push(c),
        }
    }
    tuples
}

/// Every `('key')` in a path, unquoted.
fn keys(path: &str) -> Vec<String> {
    let mut keys = Vec::new();
    let mut rest = path;
    while let Some(start) = rest.find("('") {
        let mut key = String::new();
        let mut end = None;
        let mut chars = rest[start + 2..].char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c != '\'' {
                key.push(c);
            } else if matches!(chars.peek(), Some((_, '\''))) {
                chars.next();
                key.push('\'');
            } else {
                end = Some(start + 2 + i + 1);
                break;
            }
        }
        match end {
            Some(end) => {
                keys.push(key);
                rest = &rest[end..];
            }
            None => break,
        }
    }
    keys
}

fn first_key(path: &str) -> String {
    keys(path).into_iter().next().unwrap_or_default()
}

fn number_after(path: &str, label: &str) -> Option<u64> {
    let start = path.find(label)? + label.len();
    let digits: String = path[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn unique_name(dimension: &str, element: &str) -> String {
    let bracket = |s: &str| format!("[{}]", s.replace(']', "]]"));
    format!("{}.{}.{}", bracket(dimension), bracket(dimension), bracket(element))
}

fn body_json(request: &Request) -> Value {
    match &request.body {
        RequestBody::Json(value) => value.clone(),
        _ => Value::Null,
    }
}

fn body_bytes(request: &Request) -> Vec<u8> {
    match &request.body {
        RequestBody::Bytes { data, .. } => data.to_vec(),
        _ => Vec::new(),
    }
}

fn json_reply(status: u16, value: Value) -> HttpResponse {
    HttpResponseBuilder::new().status_code(status).json(&value).build()
}

fn text_reply(text: &str) -> HttpResponse {
    HttpResponseBuilder::new()
        .header("Content-Type", "text/plain")
        .body(text.as_bytes().to_vec())
        .build()
}

/// `Sales`: Version x Period x Measure, with `Comment` a string measure.
pub fn sales_server(version: &str) -> Arc<FakeServer> {
    let server = FakeServer::new(version);
    server.cube("Sales", &["Version", "Period", "Measure"]);
    server.elements("Version", &["Actual", "Plan"]);
    server.elements("Period", &["Jan", "Feb", "Mar", "Apr", "May"]);
    server.elements("Measure", &["Units", "Price", "Comment"]);
    server.string_measures(&["Comment"]);
    server
}

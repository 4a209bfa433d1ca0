//! A stand-in runtime used by the integration tests.
//!
//! It speaks the worker command line and line protocol but executes nothing:
//! a "module" is a wasm header, an optional import section and a custom
//! section named `mock` holding directives, one per line:
//!
//! - `invalid` fails validation, loading and instantiation
//! - `start-trap` fails instantiation with a trap
//! - `start-bump-trap` bumps the shared counter, then fails instantiation
//!   with a trap
//! - `pages N` sets the initial memory size
//!
//! Every instance exports the same built-in functions (`add`, `grow`,
//! `size`, `inc`, `count`, `bump_trap`, `oob`, `trap`, `recurse`, `nan32`,
//! `id`, `sleep`, `crash`, `set_g`) and a global `g`. `inc`, `count` and
//! `bump_trap` act on the counter of the first imported instance, so modules
//! linked against the same instance share it.

use clap::{Args, Parser as ClapParser, Subcommand};
use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use wastrun::binary::{custom_section, import_modules};
use wastrun::protocol::{Request, Response, ThreadLine, MAIN_MODULE};
use wastrun::registry::SPECTEST;
use wastrun::value::WireArg;

const MAX_PAGES: u64 = 65536;

#[derive(ClapParser, Debug)]
#[command(about = "Scripted stand-in for a WebAssembly runtime")]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    Run(RunArgs),
    Validate { module: PathBuf },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long)]
    batch: bool,
    #[arg(long = "link", value_name = "NAME=PATH")]
    links: Vec<String>,
    #[arg(long, allow_hyphen_values = true)]
    invoke: Option<String>,
    #[arg(long)]
    instantiate: bool,
    module: PathBuf,
    #[arg(allow_hyphen_values = true)]
    args: Vec<String>,
}

#[derive(Debug, Default)]
struct ModuleInfo {
    imports: Vec<String>,
    invalid: bool,
    start_trap: bool,
    start_bump_trap: bool,
    pages: u64,
}

fn read_module(path: &Path) -> Result<ModuleInfo, String> {
    let bytes = fs::read(path).map_err(|e| format!("{}: {e}", path.display()))?;
    let imports = import_modules(&bytes).map_err(|e| format!("malformed module: {e}"))?;
    let mut info = ModuleInfo {
        imports,
        ..ModuleInfo::default()
    };
    let directives = custom_section(&bytes, "mock").map_err(|e| format!("malformed module: {e}"))?;
    let text = String::from_utf8_lossy(directives.unwrap_or_default());
    for line in text.lines().map(str::trim) {
        match line.split_once(' ') {
            Some(("pages", n)) => info.pages = n.trim().parse().map_err(|_| format!("bad directive {line:?}"))?,
            _ if line == "invalid" => info.invalid = true,
            _ if line == "start-trap" => info.start_trap = true,
            _ if line == "start-bump-trap" => info.start_bump_trap = true,
            _ if line.is_empty() => {}
            _ => return Err(format!("bad directive {line:?}")),
        }
    }
    Ok(info)
}

#[derive(Debug, Default)]
struct State {
    pages: u64,
    counter: u64,
    global: u64,
}

#[derive(Debug, Clone)]
struct Instance {
    state: Arc<Mutex<State>>,
    /// Owner of the counter `inc` bumps.
    counter: Arc<Mutex<State>>,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn instantiate(info: &ModuleInfo, resolve: impl Fn(&str) -> Option<Instance>) -> Result<Instance, String> {
    if info.invalid {
        return Err("invalid module".to_string());
    }
    let mut counter = None;
    for import in info.imports.iter().filter(|m| *m != SPECTEST) {
        let Some(provider) = resolve(import) else {
            return Err(format!("unknown import: module {import}"));
        };
        counter.get_or_insert(provider.counter);
    }
    let state = Arc::new(Mutex::new(State {
        pages: info.pages,
        ..State::default()
    }));
    // the start function writes through its imports before trapping
    if info.start_bump_trap {
        lock(counter.as_ref().unwrap_or(&state)).counter += 1;
        return Err("unreachable".to_string());
    }
    if info.start_trap {
        return Err("unreachable".to_string());
    }
    Ok(Instance {
        counter: counter.unwrap_or_else(|| Arc::clone(&state)),
        state,
    })
}

fn words(args: &[WireArg]) -> Vec<u64> {
    args.iter()
        .flat_map(|a| match a {
            WireArg::Word(w) => vec![*w],
            WireArg::Vector(lo, hi) => vec![*lo, *hi],
        })
        .collect()
}

fn call(instance: &Instance, function: &str, args: &[WireArg]) -> Response {
    let args = words(args);
    let arg = |i: usize| args.get(i).copied().unwrap_or(0);
    match function {
        "add" => Response::Ok(vec![arg(0).wrapping_add(arg(1)) & 0xffff_ffff]),
        "size" => Response::Ok(vec![lock(&instance.state).pages]),
        "grow" => {
            let mut state = lock(&instance.state);
            let old = state.pages;
            if old + arg(0) > MAX_PAGES {
                return Response::Ok(vec![u64::from(u32::MAX)]);
            }
            state.pages += arg(0);
            Response::Ok(vec![old])
        }
        "inc" => {
            let mut state = lock(&instance.counter);
            state.counter += 1;
            Response::Ok(vec![state.counter])
        }
        "count" => Response::Ok(vec![lock(&instance.counter).counter]),
        "bump_trap" => {
            lock(&instance.counter).counter += 1;
            Response::Error("unreachable".to_string())
        }
        "oob" => Response::Error("out of bounds memory access".to_string()),
        "trap" => Response::Error("unreachable".to_string()),
        "recurse" => Response::Error("call stack exhausted".to_string()),
        "nan32" => Response::Ok(vec![0x7fc0_0000]),
        "id" => Response::Ok(args),
        "sleep" => {
            thread::sleep(Duration::from_millis(arg(0)));
            Response::Ok(vec![])
        }
        "crash" => process::exit(3),
        "set_g" => {
            lock(&instance.state).global = arg(0);
            Response::Ok(vec![])
        }
        _ => Response::Error(format!("unknown function {function:?}")),
    }
}

fn get(instance: &Instance, global: &str) -> Response {
    match global {
        "g" => Response::Ok(vec![lock(&instance.state).global]),
        _ => Response::Error(format!("unknown global {global:?}")),
    }
}

/// Instantiate each `--link` in order, later links seeing earlier ones.
fn link_instances(links: &[String]) -> Result<HashMap<String, Instance>, String> {
    let mut linked = HashMap::new();
    for link in links {
        let (name, path) = link.split_once('=').ok_or_else(|| format!("bad --link {link:?}"))?;
        let info = read_module(Path::new(path))?;
        let instance = instantiate(&info, |m| linked.get(m).cloned())?;
        linked.insert(name.to_string(), instance);
    }
    Ok(linked)
}

fn start(args: &RunArgs) -> Result<(Instance, HashMap<String, Instance>), String> {
    let linked = link_instances(&args.links)?;
    let info = read_module(&args.module)?;
    let instance = instantiate(&info, |m| linked.get(m).cloned())?;
    Ok((instance, linked))
}

struct PendingThread {
    name: String,
    instance: Instance,
    calls: Vec<(String, Vec<WireArg>)>,
}

/// State of a `--batch` worker.
struct Batch {
    own: Instance,
    main: Option<String>,
    residents: HashMap<String, Instance>,
    registered: HashMap<String, Instance>,
    open: Option<PendingThread>,
    running: HashMap<String, JoinHandle<Vec<Response>>>,
}

impl Batch {
    fn main_instance(&self) -> &Instance {
        self.main
            .as_ref()
            .and_then(|m| self.residents.get(m))
            .unwrap_or(&self.own)
    }

    fn lookup(&self, module: &str) -> Option<&Instance> {
        self.registered.get(module).or_else(|| self.residents.get(module))
    }

    /// Answer one request; `None` for requests that are not acknowledged.
    fn handle(&mut self, request: Request, out: &mut impl Write) -> io::Result<Option<Response>> {
        let unknown = |m: &str| Response::Error(format!("unknown module {m}"));
        let response = match request {
            Request::Invoke { name, args } => call(self.main_instance(), &name, &args),
            Request::InvokeOn { module, name, args } => match self.lookup(&module) {
                Some(instance) => call(instance, &name, &args),
                None => unknown(&module),
            },
            Request::Get { name } => get(self.main_instance(), &name),
            Request::GetOn { module, name } => match self.lookup(&module) {
                Some(instance) => get(instance, &name),
                None => unknown(&module),
            },
            Request::Load { name, path } => {
                let loaded = read_module(&path).and_then(|info| instantiate(&info, |m| self.registered.get(m).cloned()));
                match loaded {
                    Ok(instance) => {
                        self.residents.insert(name, instance);
                        Response::Ok(vec![])
                    }
                    Err(e) => Response::Error(e),
                }
            }
            Request::Register { name } => {
                let instance = self.main_instance().clone();
                self.registered.insert(name, instance);
                Response::Ok(vec![])
            }
            Request::SetMain { name } if name == MAIN_MODULE => {
                self.main = None;
                Response::Ok(vec![])
            }
            Request::SetMain { name } => {
                if self.residents.contains_key(&name) {
                    self.main = Some(name);
                    Response::Ok(vec![])
                } else {
                    unknown(&name)
                }
            }
            Request::ThreadBegin { name, module } => {
                let instance = match &module {
                    None => Some(self.main_instance().clone()),
                    Some(m) => self.lookup(m).cloned(),
                };
                self.open = instance.map(|instance| PendingThread {
                    name,
                    instance,
                    calls: Vec::new(),
                });
                return Ok(None);
            }
            Request::ThreadInvoke { name, args } => {
                if let Some(open) = self.open.as_mut() {
                    open.calls.push((name, args));
                }
                return Ok(None);
            }
            Request::ThreadEnd => match self.open.take() {
                Some(pending) => {
                    let PendingThread { name, instance, calls } = pending;
                    let handle = thread::spawn(move || {
                        calls
                            .iter()
                            .map(|(function, args)| call(&instance, function, args))
                            .collect()
                    });
                    self.running.insert(name, handle);
                    Response::Ok(vec![])
                }
                None => Response::Error("no thread open".to_string()),
            },
            Request::ThreadWait { name } => {
                let results = match self.running.remove(&name) {
                    Some(handle) => handle.join().unwrap_or_default(),
                    None => Vec::new(),
                };
                for result in results {
                    writeln!(out, "{}", ThreadLine::Result(result))?;
                }
                writeln!(out, "{}", ThreadLine::Done)?;
                out.flush()?;
                return Ok(None);
            }
        };
        Ok(Some(response))
    }
}

fn batch(own: Instance, registered: HashMap<String, Instance>) -> io::Result<()> {
    let mut worker = Batch {
        own,
        main: None,
        residents: HashMap::new(),
        registered,
        open: None,
        running: HashMap::new(),
    };
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in stdin.lock().lines() {
        let line = line?;
        let reply = match Request::parse(&line) {
            Ok(request) => worker.handle(request, &mut out)?,
            Err(e) => Some(Response::Error(e.to_string())),
        };
        if let Some(reply) = reply {
            writeln!(out, "{reply}")?;
            out.flush()?;
        }
    }
    Ok(())
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("{message}");
    process::exit(1);
}

fn main() {
    let cli = Cli::parse();
    match cli.mode {
        Mode::Validate { module } => match read_module(&module) {
            Ok(info) if !info.invalid => {}
            Ok(_) => fail("invalid module"),
            Err(e) => fail(e),
        },
        Mode::Run(args) => {
            let (instance, linked) = start(&args).unwrap_or_else(|e| fail(e));
            if args.batch {
                if let Err(e) = batch(instance, linked) {
                    fail(e);
                }
            } else if let Some(function) = &args.invoke {
                let wire = args
                    .args
                    .iter()
                    .map(|a| a.parse::<WireArg>().map_err(|_| format!("bad argument {a:?}")))
                    .collect::<Result<Vec<_>, _>>()
                    .unwrap_or_else(|e| fail(e));
                match call(&instance, function, &wire) {
                    Response::Ok(words) => {
                        let words: Vec<String> = words.iter().map(u64::to_string).collect();
                        println!("{}", words.join(" "));
                    }
                    Response::Error(message) => fail(message),
                }
            }
        }
    }
}

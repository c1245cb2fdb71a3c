use autodispose::*;
use crossbeam_channel::{Sender, unbounded};
use std::thread;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(clap::Parser)]
#[command(name = "autodispose-demo", version, about = "Deterministic disposal demonstration")]
struct Cli {
    /// Make DoWork fail after its resources are registered
    #[arg(short, long)]
    fail: bool,

    /// Run an inner intercepted call from inside DoWork
    #[arg(short, long)]
    nested: bool,

    /// Number of call chains to run concurrently, one thread each
    #[arg(short, long, default_value_t = 1)]
    chains: usize,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy)]
struct Options {
    fail: bool,
    nested: bool,
}

struct Event {
    chain: String,
    text: String,
}

/// Funnels output from every chain thread to the main thread.
#[derive(Clone)]
struct Console {
    chain: String,
    tx: Sender<Event>,
}

impl Console {
    fn say(&self, text: impl Into<String>) {
        let event = Event {
            chain: self.chain.clone(),
            text: text.into(),
        };
        if let Err(e) = self.tx.send(event) {
            log::warn!("Failed to send console event: {e:?}");
        }
    }
}

/// Resource with its own cleanup logic.
struct DerivedDisposable {
    console: Console,
}

impl CleanupHook for DerivedDisposable {
    fn cleanup(&mut self) -> Result<(), CleanupError> {
        self.console.say("DerivedDisposable.cleanup called");
        Ok(())
    }
}

/// Ordinary disposable protected by adopting it into a handle.
struct PlainDisposable {
    console: Console,
}

impl Disposable for PlainDisposable {
    fn dispose(&mut self) -> Result<(), CleanupError> {
        self.console.say("PlainDisposable.dispose called");
        Ok(())
    }
}

struct Helper {
    console: Console,
}

impl ScopeBound for Helper {}

impl Helper {
    fn assist(&self, chain: &CallChain) -> Result<(), DisposalError> {
        self.console.say("Helper: start");
        let console = self.console.clone();
        ResourceHandle::defer(chain, move || {
            console.say("Helper deferred cleanup called");
            Ok(())
        })?;
        self.console.say("Helper: end");
        Ok(())
    }
}

struct Worker {
    console: Console,
    helper: InterceptingDispatcher<Helper>,
    options: Options,
}

impl ScopeBound for Worker {}

impl Worker {
    fn new(chain: &CallChain, console: Console, options: Options) -> Self {
        let helper = InterceptingDispatcher::construct(chain, |_| Helper { console: console.clone() });
        Worker {
            console,
            helper,
            options,
        }
    }

    fn do_work(&self, chain: &CallChain) -> Result<(), BoxError> {
        self.console.say("DoWork: start");
        ResourceHandle::with_cleanup(
            chain,
            DerivedDisposable {
                console: self.console.clone(),
            },
        )?;
        ResourceHandle::adopt(
            chain,
            PlainDisposable {
                console: self.console.clone(),
            },
        )?;

        if self.options.nested {
            self.helper.call(chain, |helper, chain| helper.assist(chain))?;
            self.console.say("DoWork: helper returned");
        }
        if self.options.fail {
            return Err(format!("DoWork failed with {} resource(s) pending", chain.pending()).into());
        }
        self.console.say("DoWork: end");
        Ok(())
    }
}

fn run_chain(index: usize, options: Options, tx: Sender<Event>) {
    let chain = CallChain::with_config(DisposalConfig::new().with_label(format!("chain-{index}")));
    let console = Console {
        chain: chain.id().to_string(),
        tx,
    };

    let worker = InterceptingDispatcher::construct(&chain, |chain| Worker::new(chain, console.clone(), options));
    console.say("Main: calling DoWork");
    match worker.call(&chain, |worker, chain| worker.do_work(chain)) {
        Ok(()) => console.say("Main: DoWork returned"),
        Err(err) => console.say(format!("Main: DoWork failed: {err}")),
    }
}

fn print_event(event: &Event, json: bool) {
    if json {
        println!("{}", serde_json::json!({ "chain": event.chain, "event": event.text }));
    } else {
        println!("[{}] {}", event.chain, event.text);
    }
}

fn main() -> Result<(), BoxError> {
    // Initialize logger (controlled by RUST_LOG)
    env_logger::init();

    let cli = <Cli as clap::Parser>::parse();
    let options = Options {
        fail: cli.fail,
        nested: cli.nested,
    };

    let (tx, rx) = unbounded::<Event>();
    let workers = (0..cli.chains.max(1))
        .map(|index| {
            let tx = tx.clone();
            thread::Builder::new()
                .name(format!("chain-{index}"))
                .spawn(move || run_chain(index, options, tx))
        })
        .collect::<Result<Vec<_>, _>>()?;
    drop(tx);

    for event in rx.iter() {
        print_event(&event, cli.json);
    }
    for worker in workers {
        if worker.join().is_err() {
            log::error!("a chain thread panicked");
        }
    }
    Ok(())
}

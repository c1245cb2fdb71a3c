use autodispose::*;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[ctor::ctor]
fn __init_test_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default()).is_test(true).try_init();
}

type Journal = Rc<RefCell<Vec<String>>>;

#[derive(Default)]
struct Recorded {
    failures: RefCell<Vec<(String, CleanupStage, bool)>>,
    violations: RefCell<Vec<String>>,
    disposed: RefCell<Vec<String>>,
    frames: RefCell<Vec<(usize, usize)>>,
}

#[derive(Clone, Default)]
struct RecordingSink(Rc<Recorded>);

impl DiagnosticSink for RecordingSink {
    fn cleanup_failed(&self, _chain: ChainRef<'_>, failure: &CleanupFailure) {
        self.0
            .failures
            .borrow_mut()
            .push((failure.name.clone(), failure.stage, failure.reason.is_panic()));
    }

    fn invariant_violated(&self, _chain: ChainRef<'_>, error: &DisposalError) {
        self.0.violations.borrow_mut().push(error.to_string());
    }

    fn disposed(&self, _chain: ChainRef<'_>, name: &str) {
        self.0.disposed.borrow_mut().push(name.to_string());
    }

    fn frame_unwound(&self, _chain: ChainRef<'_>, watermark: usize, delta: usize) {
        self.0.frames.borrow_mut().push((watermark, delta));
    }
}

fn recording_chain() -> (CallChain, RecordingSink) {
    let sink = RecordingSink::default();
    let chain = CallChain::with_config(DisposalConfig::new().with_sink(sink.clone()).with_label("failures"));
    (chain, sink)
}

struct Flaky {
    journal: Journal,
    name: &'static str,
    mode: Mode,
}

#[derive(Clone, Copy)]
enum Mode {
    Fine,
    Errors,
    Panics,
}

impl CleanupHook for Flaky {
    fn cleanup(&mut self) -> Result<(), CleanupError> {
        self.journal.borrow_mut().push(self.name.to_string());
        match self.mode {
            Mode::Fine => Ok(()),
            Mode::Errors => Err(format!("{} refused to close", self.name).into()),
            Mode::Panics => panic!("{} blew up", self.name),
        }
    }
}

struct CountedResource {
    releases: Rc<Cell<usize>>,
}

impl Disposable for CountedResource {
    fn dispose(&mut self) -> Result<(), CleanupError> {
        self.releases.set(self.releases.get() + 1);
        Ok(())
    }
}

struct Service;
impl ScopeBound for Service {}

fn flaky(chain: &CallChain, journal: &Journal, name: &'static str, mode: Mode) {
    HandleBuilder::new()
        .name(name)
        .on_cleanup(Flaky {
            journal: Rc::clone(journal),
            name,
            mode,
        })
        .register(chain)
        .unwrap();
}

#[test]
fn failing_cleanups_do_not_stop_the_others() {
    let journal = Journal::default();
    let (chain, sink) = recording_chain();
    let service = InterceptingDispatcher::wrap(&chain, Service);

    let answer = service.call(&chain, |_, chain| {
        flaky(chain, &journal, "a", Mode::Fine);
        flaky(chain, &journal, "b", Mode::Panics);
        flaky(chain, &journal, "c", Mode::Errors);
        flaky(chain, &journal, "d", Mode::Fine);
        42
    });

    assert_eq!(answer, 42);
    assert_eq!(*journal.borrow(), ["d", "c", "b", "a"]);
    assert_eq!(
        *sink.0.failures.borrow(),
        [("c".to_string(), CleanupStage::Hook, false), ("b".to_string(), CleanupStage::Hook, true)]
    );
    assert_eq!(*sink.0.disposed.borrow(), ["d", "a"]);
    assert_eq!(*sink.0.frames.borrow(), [(0, 4)]);
}

#[test]
fn failing_cleanup_does_not_replace_the_callers_error() {
    let journal = Journal::default();
    let (chain, sink) = recording_chain();
    let service = InterceptingDispatcher::wrap(&chain, Service);

    let result: Result<(), String> = service.call(&chain, |_, chain| {
        flaky(chain, &journal, "a", Mode::Errors);
        Err("original failure".to_string())
    });

    assert_eq!(result.unwrap_err(), "original failure");
    assert_eq!(sink.0.failures.borrow().len(), 1);
}

#[test]
fn failing_cleanup_does_not_replace_the_callers_panic() {
    let journal = Journal::default();
    let (chain, sink) = recording_chain();
    let service = InterceptingDispatcher::wrap(&chain, Service);

    let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        service.call(&chain, |_, chain| {
            flaky(chain, &journal, "a", Mode::Panics);
            if chain.is_intercepting() {
                panic!("original panic");
            }
        })
    }));

    let payload = caught.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"original panic"));
    assert_eq!(*journal.borrow(), ["a"]);
    assert_eq!(sink.0.failures.borrow().len(), 1);
}

#[test]
fn adopted_resource_is_released_exactly_once_when_hook_throws() {
    for mode in [Mode::Errors, Mode::Panics] {
        let journal = Journal::default();
        let releases = Rc::new(Cell::new(0));
        let (chain, sink) = recording_chain();
        let service = InterceptingDispatcher::wrap(&chain, Service);

        service.call(&chain, |_, chain| {
            HandleBuilder::new()
                .name("file")
                .resource(CountedResource {
                    releases: Rc::clone(&releases),
                })
                .on_cleanup(Flaky {
                    journal: Rc::clone(&journal),
                    name: "file",
                    mode,
                })
                .register(chain)
                .unwrap();
        });

        assert_eq!(releases.get(), 1);
        assert_eq!(*journal.borrow(), ["file"]);
        let failures = sink.0.failures.borrow();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].1, CleanupStage::Hook);
    }
}

#[test]
fn failing_resource_release_still_runs_the_hook() {
    struct Stubborn;
    impl Disposable for Stubborn {
        fn dispose(&mut self) -> Result<(), CleanupError> {
            Err(std::io::Error::other("handle already closed").into())
        }
    }

    let journal = Journal::default();
    let (chain, sink) = recording_chain();
    let service = InterceptingDispatcher::wrap(&chain, Service);

    service.call(&chain, |_, chain| {
        HandleBuilder::new()
            .name("stubborn")
            .resource(Stubborn)
            .on_cleanup(Flaky {
                journal: Rc::clone(&journal),
                name: "stubborn",
                mode: Mode::Fine,
            })
            .register(chain)
            .unwrap();
    });

    assert_eq!(*journal.borrow(), ["stubborn"]);
    assert_eq!(*sink.0.failures.borrow(), [("stubborn".to_string(), CleanupStage::Resource, false)]);
}

#[test]
fn registration_outside_any_intercepted_call_fails_fast() {
    let (chain, sink) = recording_chain();

    let err = ResourceHandle::register(&chain).unwrap_err();
    assert!(matches!(err, DisposalError::NoActiveScope { chain: id, .. } if id == chain.id()));
    assert_eq!(chain.pending(), 0);

    // A stack alone is not enough: it must belong to an active frame.
    let service = InterceptingDispatcher::wrap(&chain, Service);
    service.call(&chain, |_, _| ());
    let err = ResourceHandle::defer(&chain, || Ok(())).unwrap_err();
    assert!(matches!(err, DisposalError::NoActiveScope { .. }));
    assert_eq!(chain.pending(), 0);

    assert_eq!(sink.0.violations.borrow().len(), 2);
    assert!(sink.0.violations.borrow()[1].contains("deferred"));
}

#[test]
fn delta_is_never_negative_in_a_well_formed_run() {
    let journal = Journal::default();
    let (chain, sink) = recording_chain();
    let service = InterceptingDispatcher::wrap(&chain, Service);

    service.call(&chain, |_, chain| {
        flaky(chain, &journal, "outer", Mode::Fine);
        for _ in 0..3 {
            service.call(chain, |_, chain| flaky(chain, &journal, "inner", Mode::Fine));
        }
        service.call(chain, |_, _| ());
    });

    assert!(sink.0.violations.borrow().is_empty());
    assert_eq!(*sink.0.frames.borrow(), [(1, 1), (1, 1), (1, 1), (1, 0), (0, 1)]);
}

/// Panics on every report it receives.
struct BrokenSink;

impl DiagnosticSink for BrokenSink {
    fn cleanup_failed(&self, _chain: ChainRef<'_>, failure: &CleanupFailure) {
        panic!("sink cannot record {failure}");
    }

    fn invariant_violated(&self, _chain: ChainRef<'_>, error: &DisposalError) {
        panic!("sink cannot record {error}");
    }

    fn frame_unwound(&self, _chain: ChainRef<'_>, _watermark: usize, _delta: usize) {
        panic!("sink cannot record frames");
    }
}

#[test]
fn panicking_sink_neither_skips_releases_nor_replaces_the_result() {
    let journal = Journal::default();
    let chain = CallChain::with_config(DisposalConfig::new().with_sink(BrokenSink));
    let service = InterceptingDispatcher::wrap(&chain, Service);

    let answer = service.call(&chain, |_, chain| {
        let first = Rc::clone(&journal);
        ResourceHandle::defer(chain, move || {
            first.borrow_mut().push("first".to_string());
            Ok(())
        })
        .unwrap();
        ResourceHandle::defer(chain, || Err("bad".into())).unwrap();
        flaky(chain, &journal, "last", Mode::Panics);
        7
    });

    assert_eq!(answer, 7);
    assert_eq!(*journal.borrow(), ["last", "first"]);
    assert_eq!(chain.pending(), 0);
    assert_eq!(chain.depth(), 0);

    // Reporting a misplaced registration must not panic either.
    let err = ResourceHandle::register(&chain).unwrap_err();
    assert!(matches!(err, DisposalError::NoActiveScope { .. }));
}

#[test]
fn one_sink_can_serve_several_chains() {
    let recorder = RecordingSink::default();
    let shared: Rc<dyn DiagnosticSink> = Rc::new(recorder.clone());
    let left = CallChain::with_config(DisposalConfig::new().with_shared_sink(Rc::clone(&shared)).with_label("left"));
    let right = CallChain::with_config(DisposalConfig::new().with_shared_sink(shared).with_label("right"));
    let journal = Journal::default();
    let service = InterceptingDispatcher::wrap(&left, Service);

    service.call(&left, |_, chain| flaky(chain, &journal, "l", Mode::Errors));
    service.call(&right, |_, chain| flaky(chain, &journal, "r", Mode::Fine));

    assert_eq!(*journal.borrow(), ["l", "r"]);
    assert_eq!(*recorder.0.failures.borrow(), [("l".to_string(), CleanupStage::Hook, false)]);
    assert_eq!(*recorder.0.disposed.borrow(), ["r"]);
    assert_eq!(*recorder.0.frames.borrow(), [(0, 1), (0, 1)]);
}

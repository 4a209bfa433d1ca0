mod common;

#[cfg(test)]
mod tests {
    use crate::common::{mock_worker, Workspace};
    use rstest::rstest;
    use std::time::Duration;
    use wastrun::config::LinkMap;
    use wastrun::protocol::Response;
    use wastrun::session::{oneshot, SessionError, SessionState, WorkerSession};
    use wastrun::value::WireArg;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn session(ws: &Workspace, directives: &[&str]) -> WorkerSession {
        let path = ws.module("m.wasm", &[], directives);
        WorkerSession::new(mock_worker(), path, LinkMap::new())
    }

    #[test]
    fn pristine_calls_run_one_shot() {
        let ws = Workspace::new();
        let mut s = session(&ws, &[]);
        let r = s.invoke("add", &[WireArg::Word(2), WireArg::Word(3)], TIMEOUT).unwrap();
        assert_eq!(r, Response::Ok(vec![5]));
        assert_eq!(s.state(), SessionState::Unstarted);

        let r = s.invoke("trap", &[], TIMEOUT).unwrap();
        assert_eq!(r, Response::Error("unreachable".into()));
        assert_eq!(s.state(), SessionState::Unstarted);
    }

    #[test]
    fn stateful_calls_keep_memory() {
        let ws = Workspace::new();
        let mut s = session(&ws, &["pages 1"]);
        s.mark_stateful();
        assert_eq!(s.invoke("grow", &[WireArg::Word(2)], TIMEOUT).unwrap(), Response::Ok(vec![1]));
        assert_eq!(s.state(), SessionState::Running);
        assert_eq!(s.invoke("size", &[], TIMEOUT).unwrap(), Response::Ok(vec![3]));
    }

    #[test]
    fn vector_arguments_need_the_persistent_worker() {
        let ws = Workspace::new();
        let mut s = session(&ws, &[]);
        let r = s.invoke("id", &[WireArg::Vector(1, 2), WireArg::Word(7)], TIMEOUT).unwrap();
        assert_eq!(r, Response::Ok(vec![1, 2, 7]));
        assert_eq!(s.state(), SessionState::Running);
        assert!(!s.needs_persistent_state());
    }

    #[test]
    fn globals_are_read_from_the_persistent_worker() {
        let ws = Workspace::new();
        let mut s = session(&ws, &[]);
        assert_eq!(s.get("g", TIMEOUT).unwrap(), Response::Ok(vec![0]));
        assert_eq!(s.state(), SessionState::Running);
        assert!(matches!(s.get("nope", TIMEOUT).unwrap(), Response::Error(_)));
    }

    #[test]
    fn a_dead_worker_is_retried_one_shot() {
        let ws = Workspace::new();
        let mut s = session(&ws, &[]);
        s.get("g", TIMEOUT).unwrap();
        // the persistent worker exits; the one-shot retry crashes too
        let r = s.invoke("crash", &[], TIMEOUT).unwrap();
        assert!(matches!(r, Response::Error(_)));
        assert_eq!(s.state(), SessionState::Dead);

        // the next persistent call brings up a fresh worker
        assert_eq!(s.get("g", TIMEOUT).unwrap(), Response::Ok(vec![0]));
        assert_eq!(s.state(), SessionState::Running);
    }

    #[test]
    fn stateful_crash_is_reported() {
        let ws = Workspace::new();
        let mut s = session(&ws, &[]);
        s.mark_stateful();
        assert!(matches!(s.invoke("crash", &[], TIMEOUT), Err(SessionError::Died)));
        assert_eq!(s.state(), SessionState::Dead);
        assert!(!s.is_alive());
    }

    #[rstest]
    #[case::persistent(true)]
    #[case::one_shot(false)]
    fn slow_calls_time_out(#[case] stateful: bool) {
        let ws = Workspace::new();
        let mut s = session(&ws, &[]);
        if stateful {
            s.mark_stateful();
        }
        let r = s.invoke("sleep", &[WireArg::Word(5_000)], Duration::from_millis(200));
        assert!(matches!(r, Err(SessionError::Timeout(_))));
        if stateful {
            assert_eq!(s.state(), SessionState::Dead);
        }
    }

    #[test]
    fn closed_sessions_refuse_calls() {
        let ws = Workspace::new();
        let mut s = session(&ws, &[]);
        s.get("g", TIMEOUT).unwrap();
        s.close();
        assert_eq!(s.state(), SessionState::Closed);
        assert!(matches!(s.get("g", TIMEOUT), Err(SessionError::NotRunning)));
    }

    #[test]
    fn residents_registration_and_main_module() {
        let ws = Workspace::new();
        let mut s = session(&ws, &[]);
        let other = ws.module("n.wasm", &["M"], &[]);

        assert!(matches!(s.load_module("$N", &other, TIMEOUT).unwrap(), Response::Error(_)));
        assert_eq!(s.register_module("M", TIMEOUT).unwrap(), Response::Ok(vec![]));
        assert_eq!(s.load_module("$N", &other, TIMEOUT).unwrap(), Response::Ok(vec![]));

        assert_eq!(s.set_main(Some("$N"), TIMEOUT).unwrap(), Response::Ok(vec![]));
        assert_eq!(s.main(), Some("$N"));
        assert_eq!(s.invoke("set_g", &[WireArg::Word(9)], TIMEOUT).unwrap(), Response::Ok(vec![]));
        assert_eq!(s.get_on("M", "g", TIMEOUT).unwrap(), Response::Ok(vec![0]));
        assert_eq!(s.get_on("$N", "g", TIMEOUT).unwrap(), Response::Ok(vec![9]));

        // the resident shares its provider's counter
        s.invoke_on("$N", "inc", &[], TIMEOUT).unwrap();
        assert_eq!(s.invoke_on("M", "count", &[], TIMEOUT).unwrap(), Response::Ok(vec![1]));

        assert!(matches!(s.set_main(Some("$missing"), TIMEOUT).unwrap(), Response::Error(_)));
        assert_eq!(s.main(), Some("$N"));
        s.set_main(None, TIMEOUT).unwrap();
        assert_eq!(s.main(), None);
        assert_eq!(s.get("g", TIMEOUT).unwrap(), Response::Ok(vec![0]));
    }

    #[test]
    fn threads_report_each_call() {
        let ws = Workspace::new();
        let mut s = session(&ws, &[]);
        s.thread_begin("T", None).unwrap();
        s.thread_invoke("inc", &[]).unwrap();
        s.thread_invoke("inc", &[]).unwrap();
        s.thread_invoke("trap", &[]).unwrap();
        assert_eq!(s.thread_end(TIMEOUT).unwrap(), Response::Ok(vec![]));
        let results = s.thread_wait("T", TIMEOUT).unwrap();
        assert_eq!(
            results,
            vec![
                Response::Ok(vec![1]),
                Response::Ok(vec![2]),
                Response::Error("unreachable".into())
            ]
        );
        assert!(s.thread_wait("unknown", TIMEOUT).unwrap().is_empty());
    }

    #[test]
    fn validation_and_instantiation() {
        let ws = Workspace::new();
        let worker = mock_worker();
        let good = ws.module("good.wasm", &[], &[]);
        let bad = ws.module("bad.wasm", &[], &["invalid"]);
        let trap = ws.module("trap.wasm", &[], &["start-trap"]);
        let needs = ws.module("needs.wasm", &["M", "spectest"], &[]);

        assert!(oneshot::validate(&worker, &good, TIMEOUT).unwrap());
        assert!(!oneshot::validate(&worker, &bad, TIMEOUT).unwrap());
        assert!(oneshot::validate(&worker, &trap, TIMEOUT).unwrap());
        assert!(!oneshot::instantiate(&worker, &trap, &LinkMap::new(), TIMEOUT).unwrap());

        assert!(!oneshot::instantiate(&worker, &needs, &LinkMap::new(), TIMEOUT).unwrap());
        let mut links = LinkMap::new();
        links.insert("M".into(), good.clone());
        assert!(oneshot::instantiate(&worker, &needs, &links, TIMEOUT).unwrap());
    }

    #[test]
    fn linked_sessions_start_with_their_imports() {
        let ws = Workspace::new();
        let provider = ws.module("m.wasm", &[], &[]);
        let consumer = ws.module("n.wasm", &["M"], &[]);
        let mut links = LinkMap::new();
        links.insert("M".into(), provider);
        let mut s = WorkerSession::new(mock_worker(), consumer, links);
        assert_eq!(s.invoke("inc", &[], TIMEOUT).unwrap(), Response::Ok(vec![1]));
        s.mark_stateful();
        assert_eq!(s.invoke("inc", &[], TIMEOUT).unwrap(), Response::Ok(vec![1]));
        assert_eq!(s.invoke_on("M", "count", &[], TIMEOUT).unwrap(), Response::Ok(vec![1]));
    }
}

//! Drain-ordering guarantees for the deferred-callback chain.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use trellis::ConnectionContext;
use trellis_testing::ScriptedClient;

type Log = Rc<RefCell<Vec<&'static str>>>;

fn setup() -> (ScriptedClient, Rc<ConnectionContext>, Log) {
    let client = ScriptedClient::new();
    let ctx = Rc::new(ConnectionContext::new(client.clone()));
    (client, ctx, Rc::new(RefCell::new(Vec::new())))
}

/// Body-nested scopes drain innermost first: c1 nests c2 nests c3, each
/// registering callbacks directly in its body.
#[tokio::test]
async fn nested_scopes_drain_innermost_first() {
    let (_client, ctx, log) = setup();

    ctx.run_transaction(|c1| {
        let log = Rc::clone(&log);
        Box::pin(async move {
            {
                let log = Rc::clone(&log);
                c1.on_complete(move |_h| {
                    Box::pin(async move {
                        log.borrow_mut().push("c1");
                        Ok(())
                    })
                });
            }
            let ctx = Rc::clone(c1.context());
            ctx.run_transaction(|c2| {
                let log = Rc::clone(&log);
                Box::pin(async move {
                    {
                        let log = Rc::clone(&log);
                        c2.on_complete(move |_h| {
                            Box::pin(async move {
                                log.borrow_mut().push("c2");
                                Ok(())
                            })
                        });
                    }
                    let ctx = Rc::clone(c2.context());
                    ctx.run_transaction(|c3| {
                        let log = Rc::clone(&log);
                        Box::pin(async move {
                            c3.on_complete(move |_h| {
                                Box::pin(async move {
                                    log.borrow_mut().push("c3");
                                    Ok(())
                                })
                            });
                            Ok(())
                        })
                    })
                    .await?;
                    Ok(())
                })
            })
            .await?;
            Ok(())
        })
    })
    .await
    .unwrap();

    assert_eq!(*log.borrow(), vec!["c3", "c2", "c1"]);
}

/// The full re-entrancy scenario: c1's second callback opens c2 while
/// the chain drains; c2's body nests c3 and then c4. The transaction
/// opened mid-drain gets an independent chain, and within that chain
/// the later-created links sit deeper and drain first.
#[tokio::test]
async fn transactions_opened_from_callbacks_build_independent_chains() {
    let (_client, ctx, log) = setup();

    ctx.run_transaction(|c1| {
        let log = Rc::clone(&log);
        Box::pin(async move {
            {
                let log = Rc::clone(&log);
                c1.on_complete(move |_h| {
                    Box::pin(async move {
                        log.borrow_mut().push("cb1");
                        Ok(())
                    })
                });
            }
            let log = Rc::clone(&log);
            c1.on_complete(move |handle| {
                Box::pin(async move {
                    let ctx = Rc::clone(handle.context());
                    ctx.run_transaction(|c2| {
                        let log = Rc::clone(&log);
                        Box::pin(async move {
                            {
                                let log = Rc::clone(&log);
                                c2.on_complete(move |_h| {
                                    Box::pin(async move {
                                        log.borrow_mut().push("cb2");
                                        Ok(())
                                    })
                                });
                            }
                            let ctx = Rc::clone(c2.context());
                            ctx.run_transaction(|c3| {
                                let log = Rc::clone(&log);
                                Box::pin(async move {
                                    {
                                        let log = Rc::clone(&log);
                                        c3.on_complete(move |_h| {
                                            Box::pin(async move {
                                                log.borrow_mut().push("cb3a");
                                                Ok(())
                                            })
                                        });
                                    }
                                    c3.on_complete(move |_h| {
                                        Box::pin(async move {
                                            log.borrow_mut().push("cb3b");
                                            Ok(())
                                        })
                                    });
                                    Ok(())
                                })
                            })
                            .await?;
                            let ctx = Rc::clone(c2.context());
                            ctx.run_transaction(|c4| {
                                let log = Rc::clone(&log);
                                Box::pin(async move {
                                    c4.on_complete(move |_h| {
                                        Box::pin(async move {
                                            log.borrow_mut().push("cb4");
                                            Ok(())
                                        })
                                    });
                                    Ok(())
                                })
                            })
                            .await?;
                            Ok(())
                        })
                    })
                    .await?;
                    Ok(())
                })
            });
            Ok(())
        })
    })
    .await
    .unwrap();

    assert_eq!(*log.borrow(), vec!["cb1", "cb4", "cb3a", "cb3b", "cb2"]);
}

/// A callback registered from within a draining callback on the same
/// link executes during the same pass, after the already-queued ones.
#[tokio::test]
async fn late_registration_during_drain_runs_in_the_same_pass() {
    let (_client, ctx, log) = setup();

    ctx.run_transaction(|scope| {
        let log = Rc::clone(&log);
        Box::pin(async move {
            {
                let log = Rc::clone(&log);
                scope.on_complete(move |handle| {
                    Box::pin(async move {
                        log.borrow_mut().push("eager");
                        let log = Rc::clone(&log);
                        handle.on_complete(move |_h| {
                            Box::pin(async move {
                                log.borrow_mut().push("late");
                                Ok(())
                            })
                        });
                        Ok(())
                    })
                });
            }
            scope.on_complete(move |_h| {
                Box::pin(async move {
                    log.borrow_mut().push("queued");
                    Ok(())
                })
            });
            Ok(())
        })
    })
    .await
    .unwrap();

    assert_eq!(*log.borrow(), vec!["eager", "queued", "late"]);
}

/// Callbacks fire exactly once per successful outer transaction, even
/// when earlier attempts of that transaction were rolled back.
#[tokio::test]
async fn callbacks_fire_once_even_after_retries() {
    let (client, ctx, _log) = setup();
    client.fail_next_executes(trellis::ErrorKind::Deadlock, 2);

    let registered = Rc::new(Cell::new(0u32));
    let fired = Rc::new(Cell::new(0u32));

    ctx.run_transaction(|scope| {
        let registered = Rc::clone(&registered);
        let fired = Rc::clone(&fired);
        Box::pin(async move {
            scope.execute("UPDATE accounts SET balance = balance + 1").await?;
            registered.set(registered.get() + 1);
            scope.on_complete(move |_h| {
                Box::pin(async move {
                    fired.set(fired.get() + 1);
                    Ok(())
                })
            });
            Ok(())
        })
    })
    .await
    .unwrap();

    // Three attempts, but registration only happens once the conflicting
    // statement goes through; the survivor fires exactly once.
    assert_eq!(client.begins(), 3);
    assert_eq!(registered.get(), 1);
    assert_eq!(fired.get(), 1);
}

/// A failed outermost transaction drops its pending callbacks, and the
/// connection is clean for the next transaction.
#[tokio::test]
async fn failed_transaction_drops_pending_callbacks() {
    let (_client, ctx, log) = setup();

    let result: anyhow::Result<()> = ctx
        .run_transaction(|scope| {
            let log = Rc::clone(&log);
            Box::pin(async move {
                log.borrow_mut().push("body");
                let log = Rc::clone(&log);
                scope.on_complete(move |_h| {
                    Box::pin(async move {
                        log.borrow_mut().push("dropped");
                        Ok(())
                    })
                });
                Err(anyhow::anyhow!("application failure"))
            })
        })
        .await;
    assert_eq!(result.unwrap_err().to_string(), "application failure");

    // The chain pointer was cleared: a follow-up transaction drains only
    // its own callbacks.
    ctx.run_transaction(|scope| {
        let log = Rc::clone(&log);
        Box::pin(async move {
            scope.on_complete(move |_h| {
                Box::pin(async move {
                    log.borrow_mut().push("fresh");
                    Ok(())
                })
            });
            Ok(())
        })
    })
    .await
    .unwrap();

    assert_eq!(*log.borrow(), vec!["body", "fresh"]);
}

/// An error raised by a draining callback reaches the caller after the
/// commit, without being intercepted by the retry loop — even when it
/// classifies as a retryable conflict.
#[tokio::test]
async fn callback_errors_bypass_the_retry_loop() {
    let (client, ctx, _log) = setup();

    let error = ctx
        .run_transaction(|scope| {
            Box::pin(async move {
                scope.on_complete(|_h| {
                    Box::pin(async move {
                        Err(trellis::DbError::new(
                            trellis::ErrorKind::Deadlock,
                            "deadlock detected",
                        )
                        .into())
                    })
                });
                Ok(())
            })
        })
        .await
        .unwrap_err();

    assert_eq!(trellis::classify(&error), trellis::ErrorKind::Deadlock);
    // Committed once, never rolled back, never re-attempted.
    assert_eq!(client.begins(), 1);
    assert_eq!(client.commits(), 1);
    assert_eq!(client.rollbacks(), 0);
}

//! Replay is a pure function of the history: generated scripts are driven
//! to completion turn by turn, and every turn is replayed twice.

use std::time::Duration;

use proptest::prelude::*;
use reprise::{run_turn, Command, Event, ExecutionKey, OrchestrationContext, OrchestrationError, TurnStatus};

mod common;
use common::*;

const TURN_TIME_MS: u64 = 50_000;

fn key() -> ExecutionKey {
    ExecutionKey::new(QUEUE, "scripted")
}

/// 0 and 1 call a side effect, 2 sleeps, 3 waits for "go", anything else
/// fans out to two side effects at once.
async fn scripted(ctx: OrchestrationContext, input: String) -> Result<String, OrchestrationError> {
    let script: Vec<u8> = serde_json::from_str(&input).map_err(|e| e.to_string())?;
    let mut trail = Vec::new();
    for (i, op) in script.iter().enumerate() {
        match op {
            0 => trail.push(ctx.call_side_effect("a", i.to_string()).await?),
            1 => trail.push(ctx.call_side_effect("b", i.to_string()).await?),
            2 => {
                ctx.timer(Duration::from_millis(5 + i as u64)).await;
                trail.push(format!("t{i}"));
            }
            3 => trail.push(ctx.wait_for_signal("go").await),
            _ => {
                let both = ctx
                    .join(vec![
                        ctx.call_side_effect("a", format!("{i}l")),
                        ctx.call_side_effect("b", format!("{i}r")),
                    ])
                    .await;
                for r in both {
                    trail.push(r?);
                }
            }
        }
    }
    Ok(trail.join(","))
}

fn expected_trail(script: &[u8]) -> String {
    let mut trail = Vec::new();
    for (i, op) in script.iter().enumerate() {
        match op {
            0 | 1 => trail.push(i.to_string()),
            2 => trail.push(format!("t{i}")),
            3 => trail.push("sig".to_string()),
            _ => {
                trail.push(format!("{i}l"));
                trail.push(format!("{i}r"));
            }
        }
    }
    trail.join(",")
}

/// Plays the environment: every side effect echoes its input, timers fire,
/// and each signal wait gets a "sig" payload. Each turn is replayed twice and
/// both passes must agree.
fn drive(script: &[u8]) -> (Vec<Event>, TurnStatus) {
    let input = serde_json::to_string(script).unwrap();
    let mut history = vec![started("scripted", &input)];
    for _ in 0..200 {
        let out = run_turn(key(), history.clone(), TURN_TIME_MS, scripted);
        let again = run_turn(key(), history.clone(), TURN_TIME_MS, scripted);
        assert_eq!(out.commands, again.commands);
        assert_eq!(out.new_events, again.new_events);
        assert_eq!(out.status, again.status);
        if out.status.is_terminal() {
            assert!(out.new_events.is_empty());
            return (history, out.status);
        }

        history.extend(out.new_events);
        let mut next = history.last().map_or(1, |e| e.seq + 1);
        for command in out.commands {
            let event = match command {
                Command::ScheduleSideEffect { scheduled_seq, input, .. } => completed(next, scheduled_seq, &input),
                Command::StartTimer { timer_seq, fire_at_ms } => timer_fired(next, timer_seq, fire_at_ms),
                Command::WaitForSignal { name } => signal(next, &name, "sig"),
            };
            history.push(event);
            next += 1;
        }
    }
    panic!("script {script:?} did not finish");
}

fn arb_script() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(0u8..5, 0..8)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    #[test]
    fn prop_scripts_complete_with_expected_output(script in arb_script()) {
        let (_, status) = drive(&script);
        prop_assert_eq!(status, TurnStatus::Completed(expected_trail(&script)));
    }

    #[test]
    fn prop_history_seqs_are_gapless(script in arb_script()) {
        let (history, _) = drive(&script);
        let seqs: Vec<u64> = history.iter().map(|e| e.seq).collect();
        let expected: Vec<u64> = (1..=history.len() as u64).collect();
        prop_assert_eq!(seqs, expected);
    }

    #[test]
    fn prop_full_history_replays_to_same_result(script in arb_script()) {
        let (history, status) = drive(&script);
        let later = run_turn(key(), history, TURN_TIME_MS * 2, scripted);
        prop_assert_eq!(later.status, status);
        prop_assert!(later.commands.is_empty());
        prop_assert!(later.new_events.is_empty());
    }
}

#[test]
fn turn_time_does_not_change_replayed_schedule() {
    let history = vec![started("scripted", "[2,0]")];
    let early = run_turn(key(), history.clone(), 1_000, scripted);
    let late = run_turn(key(), history, 999_000, scripted);
    assert_eq!(early.commands, late.commands);
    assert!(matches!(
        early.commands[..],
        [Command::StartTimer { timer_seq: 2, fire_at_ms: 1_005 }]
    ));
}

//! Command-line presentation shells over the call controller.
//!
//! Each shell only wires collaborators together and prints what the
//! controller publishes; the call state machine lives in `calling`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;

use crate::calling::controller::{CallController, CallDeps, CallOutcome, CallSettings};
use crate::calling::invitation::{InboxEvent, IncomingCalls, RingOutcome, Ringer};
use crate::calling::remote::RemoteLayout;
use crate::calling::sim::{DeviceAvailability, SimConfig, SimulatedDevices, SimulatedPeerFactory};
use crate::calling::{AccountRole, CallStatus, Participant, RoomId, UserId};
use crate::config::Config;
use crate::relay::client::RelayClient;
use crate::relay::hub::RelayHub;
use crate::relay::local::LocalRelay;

/// Options for `tutor-call call`.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub room: Option<RoomId>,
    pub user: UserId,
    pub name: String,
    pub role: AccountRole,
    pub relay_url: String,
    pub invite: Option<UserId>,
    pub duration: Option<Duration>,
    pub share_screen_after: Option<Duration>,
    pub mute_after: Option<Duration>,
    pub camera_off_after: Option<Duration>,
    pub audio_only: bool,
    /// Decline the first invitation instead of answering it.
    pub reject: bool,
}

/// Something the `call` shell does at a fixed offset after connecting.
#[derive(Debug, Clone, Copy)]
enum Scheduled {
    ShareScreen,
    Mute,
    CameraOff,
    HangUp,
}

impl CallOptions {
    fn schedule(&self) -> Vec<(Duration, Scheduled)> {
        let mut plan: Vec<(Duration, Scheduled)> = [
            (self.share_screen_after, Scheduled::ShareScreen),
            (self.mute_after, Scheduled::Mute),
            (self.camera_off_after, Scheduled::CameraOff),
            (self.duration, Scheduled::HangUp),
        ]
        .into_iter()
        .filter_map(|(after, action)| after.map(|a| (a, action)))
        .collect();
        plan.sort_by_key(|(after, _)| *after);
        plan
    }
}

fn devices(audio_only: bool) -> SimulatedDevices {
    let devices = SimulatedDevices::new();
    if audio_only {
        devices.with_camera(DeviceAvailability::Missing)
    } else {
        devices
    }
}

/// Print every status change of `controller` until it is terminal.
fn spawn_status_printer(label: &'static str, controller: &CallController) -> tokio::task::JoinHandle<()> {
    let mut status = controller.subscribe();
    let mut layout = controller.subscribe_remote();
    tokio::spawn(async move {
        println!("[{}] {}", label, *status.borrow_and_update());
        loop {
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = status.borrow_and_update().clone();
                    println!("[{}] {}", label, current);
                    if current.is_terminal() {
                        break;
                    }
                }
                changed = layout.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = layout.borrow_and_update().clone();
                    println!("[{}] remote view: {}", label, describe_layout(&current));
                }
            }
        }
    })
}

fn describe_layout(layout: &RemoteLayout) -> String {
    let video = |v: &Option<crate::calling::remote::DisplayedVideo>| match v {
        Some(v) => format!("{:?} (mid {})", v.source, v.mid),
        None => "none".to_string(),
    };
    format!(
        "primary={} secondary={} audio={}",
        video(&layout.primary),
        video(&layout.secondary),
        layout.has_audio
    )
}

async fn wait_connected(status: &mut watch::Receiver<CallStatus>) -> bool {
    loop {
        let current = status.borrow_and_update().clone();
        if current == CallStatus::Connected {
            return true;
        }
        if current.is_terminal() || status.changed().await.is_err() {
            return false;
        }
    }
}

fn print_outcome(outcome: &CallOutcome) {
    println!("call_status={}", outcome.status);
    if let Some(reason) = &outcome.reason {
        println!("end_reason={}", reason);
    }
}

// ---- WebSocket call ----

/// Join (or ring, or wait for) a call through the WebSocket relay.
pub async fn run_call(config: &Config, opts: CallOptions) -> Result<()> {
    let client = Arc::new(
        RelayClient::connect(&opts.relay_url, opts.user.clone(), config.relay.heartbeat())
            .await
            .context("Failed to connect to the relay")?,
    );
    let participant = Participant::new(opts.user.clone(), opts.name.clone(), opts.role);

    println!();
    println!("=== Tutoring Call ===");
    println!("User:   {} ({})", participant.display_name, participant.user_id);
    println!("Role:   {}", participant.role);
    println!("Relay:  {}", opts.relay_url);

    let room = match (&opts.room, opts.role) {
        (Some(room), _) => room.clone(),
        (None, AccountRole::Student) => match wait_for_invitation(client.clone(), &opts.user, opts.reject).await? {
            Some(room) => room,
            None => return Ok(()),
        },
        (None, AccountRole::Admin) => bail!("--room is required for admin accounts"),
    };
    println!("Room:   {}", room);

    let controller = CallController::new(
        participant.clone(),
        room.clone(),
        CallSettings::from_config(config),
        CallDeps {
            relay: client.clone(),
            devices: Arc::new(devices(opts.audio_only)),
            peers: Arc::new(SimulatedPeerFactory::new(SimConfig::default())),
        },
    );
    let printer = spawn_status_printer("local", &controller);

    if let Some(callee) = &opts.invite {
        controller.mark_ringing();
        let mut ringer = Ringer::register(client.clone(), participant, config.call.invitation_timeout()).await?;
        let outcome = ringer.ring(callee, &room).await;
        if let Err(e) = ringer.close().await {
            tracing::debug!("Closing ringer failed: {}", e);
        }
        match outcome? {
            RingOutcome::Accepted => println!("call_accepted=true"),
            other => {
                println!("call_accepted=false");
                println!("ring_outcome={:?}", other);
                controller.hang_up().await;
                let _ = printer.await;
                return Ok(());
            }
        }
    }

    let run = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.run().await })
    };

    let driver = {
        let controller = controller.clone();
        let plan = opts.schedule();
        tokio::spawn(async move {
            let mut status = controller.subscribe();
            if !wait_connected(&mut status).await {
                return;
            }
            let connected_at = tokio::time::Instant::now();
            for (after, action) in plan {
                tokio::time::sleep_until(connected_at + after).await;
                match action {
                    Scheduled::ShareScreen => match controller.start_screen_share().await {
                        Ok(()) => println!("screen_share={}", controller.is_sharing_screen()),
                        Err(e) => println!("screen_share=false ({})", e),
                    },
                    Scheduled::Mute => println!("microphone_muted={}", controller.set_microphone_enabled(false)),
                    Scheduled::CameraOff => println!("camera_off={}", controller.set_camera_enabled(false)),
                    Scheduled::HangUp => controller.hang_up().await,
                }
            }
        })
    };

    let outcome = tokio::select! {
        outcome = run => outcome.context("Call task failed")?,
        _ = tokio::signal::ctrl_c() => {
            println!("Hanging up...");
            controller.hang_up().await;
            // `run` was moved into the select; wait for the terminal status instead.
            let mut status = controller.subscribe();
            while !status.borrow_and_update().is_terminal() {
                if status.changed().await.is_err() {
                    break;
                }
            }
            CallOutcome {
                status: controller.status(),
                reason: controller.end_reason(),
            }
        }
    };
    driver.abort();
    let _ = printer.await;
    print_outcome(&outcome);
    client.close();
    Ok(())
}

async fn wait_for_invitation(client: Arc<RelayClient>, user: &UserId, reject: bool) -> Result<Option<RoomId>> {
    let mut inbox = IncomingCalls::register(client, user.clone()).await?;
    println!("Waiting for an invitation...");
    let room = loop {
        match inbox.next().await {
            Some(InboxEvent::Incoming(call)) => {
                let invitation = call.invitation().clone();
                println!(
                    "incoming_call from={} ({}) room={}",
                    invitation.caller_name, invitation.caller_id, invitation.room_id
                );
                if reject {
                    call.reject().await.context("Failed to reject the invitation")?;
                    println!("invitation_rejected={}", invitation.invitation_id);
                    break None;
                }
                match call.accept().await {
                    Ok(room) => break Some(room),
                    Err(e) => println!("Could not accept: {}", e),
                }
            }
            Some(InboxEvent::Cancelled(id)) => println!("invitation_cancelled={}", id),
            None => {
                println!("Relay connection closed");
                break None;
            }
        }
    };
    inbox.close().await?;
    Ok(room)
}

// ---- In-process demo ----

/// Two participants in one process over `LocalRelay`: invitation, connect,
/// screen share on and off, hang-up.
pub async fn run_demo(config: &Config) -> Result<()> {
    let hub = Arc::new(RelayHub::new());
    let relay = Arc::new(LocalRelay::new(hub.clone()));
    let room = RoomId::from(format!("demo-{}", uuid::Uuid::new_v4().simple()));
    let settings = CallSettings {
        end_grace: Duration::from_millis(200),
        ..CallSettings::from_config(config)
    };

    let tutor = Participant::new("tutor-1".into(), "Tutor", AccountRole::Admin);
    let student = Participant::new("student-1".into(), "Student", AccountRole::Student);

    let make = |who: Participant| {
        CallController::new(
            who,
            room.clone(),
            settings.clone(),
            CallDeps {
                relay: relay.clone(),
                devices: Arc::new(SimulatedDevices::new()),
                peers: Arc::new(SimulatedPeerFactory::new(SimConfig::default())),
            },
        )
    };
    let t = make(tutor.clone());
    let s = make(student.clone());
    let t_printer = spawn_status_printer("tutor", &t);
    let s_printer = spawn_status_printer("student", &s);

    // Invitation first: the student answers, then both join the room.
    let mut inbox = IncomingCalls::register(relay.clone(), student.user_id.clone()).await?;
    let mut ringer = Ringer::register(relay.clone(), tutor, config.call.invitation_timeout()).await?;
    t.mark_ringing();
    let answer = tokio::spawn(async move {
        let accepted = match inbox.next().await {
            Some(InboxEvent::Incoming(call)) => call.accept().await.map(Some),
            _ => Ok(None),
        };
        let _ = inbox.close().await;
        accepted
    });
    let outcome = ringer.ring(&student.user_id, &room).await?;
    let _ = ringer.close().await;
    if outcome != RingOutcome::Accepted {
        bail!("Student did not accept the invitation ({:?})", outcome);
    }
    if answer.await.context("Invitation task failed")??.is_none() {
        bail!("Student never saw the invitation");
    }

    let t_run = {
        let t = t.clone();
        tokio::spawn(async move { t.run().await })
    };
    let s_run = {
        let s = s.clone();
        tokio::spawn(async move { s.run().await })
    };

    let mut t_status = t.subscribe();
    let mut s_status = s.subscribe();
    if !(wait_connected(&mut t_status).await && wait_connected(&mut s_status).await) {
        t.hang_up().await;
        bail!("Demo call did not connect: {}", t.status());
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    t.start_screen_share().await.context("Screen share failed")?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    println!("student_view_while_sharing={}", describe_layout(&s.remote_layout()));
    t.stop_screen_share().await.context("Stopping screen share failed")?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    t.hang_up().await;
    let t_out = t_run.await.context("Tutor call task failed")?;
    let s_out = s_run.await.context("Student call task failed")?;
    let _ = t_printer.await;
    let _ = s_printer.await;

    println!("tutor_status={}", t_out.status);
    println!("student_status={}", s_out.status);
    println!("rooms_open={}", hub.room_count());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> CallOptions {
        CallOptions {
            room: Some("room-1".into()),
            user: "s-1".into(),
            name: "Student".into(),
            role: AccountRole::Student,
            relay_url: "ws://127.0.0.1:9000".into(),
            invite: None,
            duration: None,
            share_screen_after: None,
            mute_after: None,
            camera_off_after: None,
            audio_only: false,
            reject: false,
        }
    }

    #[test]
    fn test_schedule_runs_in_offset_order() {
        let opts = CallOptions {
            duration: Some(Duration::from_secs(30)),
            share_screen_after: Some(Duration::from_secs(10)),
            mute_after: Some(Duration::from_secs(5)),
            ..options()
        };
        let plan: Vec<String> = opts.schedule().iter().map(|(_, a)| format!("{:?}", a)).collect();
        assert_eq!(plan, vec!["Mute", "ShareScreen", "HangUp"]);
        assert!(options().schedule().is_empty());
    }
}

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ecutune_engines::contract::TuningEngine;
use ecutune_engines::virtual_ecu::{VirtualEcuBackend, VirtualEcuConfig};
use ecutune_kernel_contracts::calibration::{MapId, ProfileId};
use ecutune_kernel_contracts::capability::EngineId;
use ecutune_kernel_contracts::changeset::{Changeset, MapChange};
use ecutune_kernel_contracts::safety::EngineSample;
use ecutune_kernel_contracts::session::{
    ApplyMode, ApplySessionId, ApplyStatus, ApplyToken, VehicleSessionId,
};
use ecutune_os::clock::SystemClock;
use ecutune_os::collaborators::{OperatorMode, StaticOperatorContext};
use ecutune_os::config::OrchestratorConfig;
use ecutune_os::{Orchestrator, OrchestratorError};
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::info;

use crate::demo::{
    stage1_profile, stock_profile, DEMO_ENGINE, DEMO_VEHICLE, STOCK_PROFILE,
};

pub const USAGE: &str = "usage: ecutune <validate|diff|simulate|live|flash> [args]
  validate [profile]
  diff <source_profile> <target_profile>
  simulate [profile] [--set map:row:col=value | map:index=value]...
  live --set <edit>... [--technician id] [--job id] [--boost psi] [--yes]
  flash [profile] [--set <edit>...] [--technician id] [--job id] [--yes]";

/// One requested cell value. `row` is set for table maps only.
#[derive(Debug, Clone, PartialEq)]
pub struct CellEdit {
    pub map_id: String,
    pub row: Option<usize>,
    pub col: usize,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Validate {
        profile: String,
    },
    Diff {
        source: String,
        target: String,
    },
    Simulate {
        profile: String,
        edits: Vec<CellEdit>,
    },
    Live {
        edits: Vec<CellEdit>,
        technician: Option<String>,
        job: Option<String>,
        boost_psi: Option<f64>,
    },
    Flash {
        profile: String,
        edits: Vec<CellEdit>,
        technician: Option<String>,
        job: Option<String>,
    },
}

/// Parses `map:index=value` (linear) or `map:row:col=value` (table).
pub fn parse_cell_edit(raw: &str) -> Result<CellEdit, String> {
    let (target, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("cell edit '{raw}' is missing '=value'"))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("cell edit '{raw}' has a non-numeric value"))?;
    let parts: Vec<&str> = target.split(':').collect();
    let index = |s: &str| {
        s.trim()
            .parse::<usize>()
            .map_err(|_| format!("cell edit '{raw}' has a bad position '{s}'"))
    };
    let (map_id, row, col) = match parts.as_slice() {
        [map, col] => (*map, None, index(col)?),
        [map, row, col] => (*map, Some(index(row)?), index(col)?),
        _ => return Err(format!("cell edit '{raw}' must be map:index or map:row:col")),
    };
    if map_id.trim().is_empty() {
        return Err(format!("cell edit '{raw}' has no map id"));
    }
    Ok(CellEdit {
        map_id: map_id.trim().to_string(),
        row,
        col,
        value,
    })
}

pub fn parse_command(args: &[String]) -> Result<Command, String> {
    let (name, rest) = args.split_first().ok_or_else(|| USAGE.to_string())?;
    let mut positional: Vec<String> = Vec::new();
    let mut edits = Vec::new();
    let mut technician = None;
    let mut job = None;
    let mut boost_psi = None;

    let mut iter = rest.iter();
    while let Some(arg) = iter.next() {
        let mut flag_value = |flag: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("{flag} needs a value"))
        };
        match arg.as_str() {
            "--set" => {
                let raw = flag_value("--set")?;
                edits.push(parse_cell_edit(&raw)?);
            }
            "--technician" => technician = Some(flag_value("--technician")?),
            "--job" => job = Some(flag_value("--job")?),
            "--boost" => {
                let raw = flag_value("--boost")?;
                boost_psi = Some(
                    raw.parse::<f64>()
                        .map_err(|_| format!("--boost value '{raw}' is not a number"))?,
                );
            }
            flag if flag.starts_with("--") => return Err(format!("unknown flag {flag}\n{USAGE}")),
            _ => positional.push(arg.clone()),
        }
    }
    let profile_arg = |i: usize| {
        positional
            .get(i)
            .cloned()
            .unwrap_or_else(|| STOCK_PROFILE.to_string())
    };

    match name.as_str() {
        "validate" => Ok(Command::Validate {
            profile: profile_arg(0),
        }),
        "diff" => match positional.as_slice() {
            [source, target] => Ok(Command::Diff {
                source: source.clone(),
                target: target.clone(),
            }),
            _ => Err("usage: ecutune diff <source_profile> <target_profile>".to_string()),
        },
        "simulate" => Ok(Command::Simulate {
            profile: profile_arg(0),
            edits,
        }),
        "live" => {
            if edits.is_empty() {
                return Err("live needs at least one --set edit".to_string());
            }
            Ok(Command::Live {
                edits,
                technician,
                job,
                boost_psi,
            })
        }
        "flash" => Ok(Command::Flash {
            profile: profile_arg(0),
            edits,
            technician,
            job,
        }),
        other => Err(format!("unknown command: {other}\n{USAGE}")),
    }
}

/// Orchestrator wired to a virtual ECU loaded with the stock demo calibration.
pub struct Workbench {
    pub orchestrator: Arc<Orchestrator>,
    pub ecu: Arc<VirtualEcuBackend>,
    engine_id: EngineId,
    vehicle: VehicleSessionId,
}

impl Workbench {
    pub fn new(config: OrchestratorConfig, runtime: Handle) -> Result<Self, String> {
        let stock = stock_profile().map_err(|e| e.to_string())?;
        let stage1 = stage1_profile().map_err(|e| e.to_string())?;
        let engine_id = EngineId::new(DEMO_ENGINE).map_err(|e| e.to_string())?;
        let vehicle = VehicleSessionId::new(DEMO_VEHICLE).map_err(|e| e.to_string())?;

        let ecu = Arc::new(VirtualEcuBackend::new(
            VirtualEcuConfig::mvp_v1(engine_id.clone()),
            stock.clone(),
        ));
        let orchestrator = Orchestrator::new(
            config,
            Arc::new(SystemClock::new()),
            Arc::new(StaticOperatorContext::new(OperatorMode::Development)),
            runtime,
        );
        orchestrator.register_engine(ecu.clone());
        orchestrator.connect_engine(&engine_id).map_err(describe)?;
        orchestrator.create_profile(stock).map_err(describe)?;
        orchestrator.create_profile(stage1).map_err(describe)?;
        info!(engine_id = %engine_id, "workbench ready");
        Ok(Self {
            orchestrator,
            ecu,
            engine_id,
            vehicle,
        })
    }

    fn changeset(
        &self,
        profile: &ProfileId,
        edits: &[CellEdit],
        author: &str,
    ) -> Result<Arc<Changeset>, String> {
        let mut changes = Vec::with_capacity(edits.len());
        for edit in edits {
            let map_id = MapId::new(edit.map_id.as_str()).map_err(|e| e.to_string())?;
            let map = self.orchestrator.get_map(profile, &map_id).map_err(describe)?;
            let old = map.grid.get(edit.row, Some(edit.col)).ok_or_else(|| {
                format!("{} has no cell at {:?}/{}", edit.map_id, edit.row, edit.col)
            })?;
            changes.push(
                MapChange::v1(map_id, edit.row, Some(edit.col), old, edit.value, "cli edit")
                    .map_err(|e| e.to_string())?,
            );
        }
        self.orchestrator
            .create_changeset(Some(profile.clone()), changes, author, "")
            .map_err(describe)
    }
}

fn describe(err: OrchestratorError) -> String {
    format!("{err} [{}]", err.boundary_class().http_status())
}

fn to_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| e.to_string())
}

fn profile_id(raw: &str) -> Result<ProfileId, String> {
    ProfileId::new(raw).map_err(|e| e.to_string())
}

/// Runs one command. `confirm` is shown the minted token and returns what the
/// operator typed back; it is the only way a write session gets armed.
pub fn execute_command(
    bench: &Workbench,
    command: Command,
    confirm: &mut dyn FnMut(ApplySessionId, &ApplyToken) -> Result<String, String>,
) -> Result<String, String> {
    let o = &bench.orchestrator;
    match command {
        Command::Validate { profile } => to_json(&o.validate(&profile_id(&profile)?).map_err(describe)?),
        Command::Diff { source, target } => to_json(
            &o.diff(&profile_id(&source)?, &profile_id(&target)?, None)
                .map_err(describe)?,
        ),
        Command::Simulate { profile, edits } => {
            let profile = profile_id(&profile)?;
            let changeset = if edits.is_empty() {
                None
            } else {
                Some(bench.changeset(&profile, &edits, "ecutune-cli")?.id)
            };
            to_json(&o.simulate(&profile, changeset).map_err(describe)?)
        }
        Command::Live {
            edits,
            technician,
            job,
            boost_psi,
        } => {
            o.arm_system();
            o.set_level(ApplyMode::LiveApply).map_err(describe)?;
            let author = technician.as_deref().unwrap_or("ecutune-cli");
            let changeset = bench.changeset(&profile_id(STOCK_PROFILE)?, &edits, author)?;
            let ticket = o
                .create_session(
                    &bench.engine_id,
                    bench.vehicle.clone(),
                    Some(changeset.id),
                    Some(ApplyMode::LiveApply),
                )
                .map_err(describe)?;
            let session_id = ticket.session.id;
            let typed = confirm(session_id, &ticket.apply_token)?;
            o.arm_session(session_id, typed.trim()).map_err(describe)?;
            let applied = o
                .apply_live(session_id, technician.as_deref(), job.as_deref())
                .map_err(describe)?;

            if let Some(psi) = boost_psi {
                let mut sample = EngineSample::idle(applied.updated_at);
                sample.boost_psi = psi;
                bench.ecu.publish_sample(&bench.vehicle, sample);
                let interval = Duration::from_millis(o.config().monitor_interval_ms);
                for _ in 0..3 {
                    thread::sleep(interval);
                    let status = o.get_session(session_id).map_err(describe)?.status;
                    if status != ApplyStatus::Completed {
                        break;
                    }
                }
            }
            to_json(&serde_json::json!({
                "session": o.get_session(session_id).map_err(describe)?,
                "snapshots": o.snapshots(session_id).len(),
                "audit": o.audit_for_session(session_id).len(),
            }))
        }
        Command::Flash {
            profile,
            edits,
            technician,
            job,
        } => {
            let profile = profile_id(&profile)?;
            o.arm_system();
            o.set_level(ApplyMode::Flash).map_err(describe)?;
            let changeset = if edits.is_empty() {
                None
            } else {
                let author = technician.as_deref().unwrap_or("ecutune-cli");
                Some(bench.changeset(&profile, &edits, author)?.id)
            };
            let ticket = o
                .create_session(
                    &bench.engine_id,
                    bench.vehicle.clone(),
                    None,
                    Some(ApplyMode::Flash),
                )
                .map_err(describe)?;
            let session_id = ticket.session.id;
            let typed = confirm(session_id, &ticket.apply_token)?;
            o.arm_session(session_id, typed.trim()).map_err(describe)?;
            let prepared = o
                .prepare_flash(session_id, &profile, changeset)
                .map_err(describe)?;
            let done = o
                .execute_flash(prepared.id, technician.as_deref(), job.as_deref())
                .map_err(describe)?;
            to_json(&done)
        }
    }
}

/// Whether the monitored engine is still connected; used in the binary's summary line.
pub fn engine_connected(bench: &Workbench) -> bool {
    bench.ecu.status().connection == ecutune_kernel_contracts::capability::EngineConnection::Connected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn bench() -> Workbench {
        Workbench::new(OrchestratorConfig::mvp_v1(), Handle::current()).unwrap()
    }

    fn echo_token(_: ApplySessionId, token: &ApplyToken) -> Result<String, String> {
        Ok(token.as_str().to_string())
    }

    #[test]
    fn at_workbench_cli_01_cell_edit_forms() {
        assert_eq!(
            parse_cell_edit("fuel_main:2:1=8.5").unwrap(),
            CellEdit {
                map_id: "fuel_main".to_string(),
                row: Some(2),
                col: 1,
                value: 8.5
            }
        );
        assert_eq!(parse_cell_edit("ign_base:3=21").unwrap().row, None);
        assert!(parse_cell_edit("ign_base:3").is_err());
        assert!(parse_cell_edit("ign_base=3").is_err());
        assert!(parse_cell_edit("ign_base:x=3").is_err());
        assert!(parse_cell_edit(":1=3").is_err());
    }

    #[test]
    fn at_workbench_cli_02_command_parsing() {
        assert_eq!(
            parse_command(&args(&["validate"])).unwrap(),
            Command::Validate {
                profile: STOCK_PROFILE.to_string()
            }
        );
        assert!(parse_command(&args(&["diff", "stock"])).is_err());
        assert!(parse_command(&args(&["live"])).is_err());
        assert!(parse_command(&args(&["live", "--set"])).is_err());
        assert!(parse_command(&args(&["frobnicate"])).is_err());
        assert!(parse_command(&args(&["validate", "--verbose"])).is_err());
        assert_eq!(
            parse_command(&args(&[
                "live", "--set", "ign_base:1=17", "--technician", "tech-7", "--boost", "31"
            ]))
            .unwrap(),
            Command::Live {
                edits: vec![parse_cell_edit("ign_base:1=17").unwrap()],
                technician: Some("tech-7".to_string()),
                job: None,
                boost_psi: Some(31.0),
            }
        );
    }

    #[tokio::test]
    async fn at_workbench_cli_03_read_only_commands_emit_json() {
        let bench = bench();
        let out = execute_command(
            &bench,
            Command::Diff {
                source: "stock".to_string(),
                target: "stage1".to_string(),
            },
            &mut echo_token,
        )
        .unwrap();
        let json: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(json["total_changes"], 11);

        let out = execute_command(
            &bench,
            Command::Validate {
                profile: "stage1".to_string(),
            },
            &mut echo_token,
        )
        .unwrap();
        let json: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(json["valid"], true);

        let err = execute_command(
            &bench,
            Command::Validate {
                profile: "missing".to_string(),
            },
            &mut echo_token,
        )
        .unwrap_err();
        assert!(err.ends_with("[404]"), "{err}");
    }

    #[tokio::test]
    async fn at_workbench_cli_04_live_apply_needs_the_minted_token() {
        let bench = bench();
        let edits = vec![parse_cell_edit("ign_base:1=17").unwrap()];
        let out = execute_command(
            &bench,
            Command::Live {
                edits: edits.clone(),
                technician: Some("tech-7".to_string()),
                job: None,
                boost_psi: None,
            },
            &mut echo_token,
        )
        .unwrap();
        let json: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(json["session"]["status"], "COMPLETED");
        assert_eq!(json["audit"], 1);
        assert_eq!(
            bench.ecu.live_cell(&MapId::new("ign_base").unwrap(), None, Some(1)),
            Some(17.0)
        );

        let err = execute_command(
            &bench,
            Command::Live {
                edits,
                technician: None,
                job: None,
                boost_psi: None,
            },
            &mut |_, _| Ok("guess".to_string()),
        )
        .unwrap_err();
        assert!(err.contains("invalid apply token"), "{err}");
    }

    #[tokio::test]
    async fn at_workbench_cli_05_flash_writes_stage1() {
        let bench = bench();
        let out = execute_command(
            &bench,
            Command::Flash {
                profile: "stage1".to_string(),
                edits: Vec::new(),
                technician: None,
                job: Some("job-9".to_string()),
            },
            &mut echo_token,
        )
        .unwrap();
        let json: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(json["state"], "COMPLETED");
        assert_eq!(json["progress"], 100);
        assert!(bench.ecu.rom_bytes(0x3000).is_some());
        assert!(engine_connected(&bench));
    }
}

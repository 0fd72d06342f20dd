use crate::collectors::ProbeReport;
use crate::inventory::System;
use crate::state::CheckResult;
use crate::sysinfo::Interpretation;

/// Per-cycle facts about a system that do not come from probing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckContext {
    pub system: u32,
    pub timestamp: i64,
    pub in_sync: Option<bool>,
    pub recent_touch_events: Option<u64>,
}

/// `None` for systems without a deployment, `false` for systems that never
/// synced.
pub fn sync_state(system: &System, now: i64, max_age_secs: u64) -> Option<bool> {
    system.deployment.as_ref()?;
    let max_age = i64::try_from(max_age_secs).unwrap_or(i64::MAX);
    Some(
        system
            .last_sync
            .is_some_and(|last| last > now.saturating_sub(max_age)),
    )
}

/// Builds the record for this cycle. The `*_since` fields are left empty;
/// they are filled in against the previous record by the transition step.
pub fn assemble(ctx: CheckContext, probes: &ProbeReport, interp: Interpretation) -> CheckResult {
    CheckResult {
        system: ctx.system,
        timestamp: ctx.timestamp,
        icmp_request: probes.icmp_request,
        ssh_login: probes.ssh.trinary(),
        ssh_outcome: probes.ssh,
        http_request: probes.http_request,
        application_state: interp.application_state,
        application_version: interp.application_version,
        smart_check: interp.smart_check,
        baytrail_freeze: interp.baytrail_freeze,
        fsck_repair: interp.fsck_repair,
        efi_mount_ok: interp.efi_mount_ok,
        root_not_ro: interp.root_not_ro,
        sensors: interp.sensors,
        ram_total: interp.ram_total,
        ram_free: interp.ram_free,
        ram_available: interp.ram_available,
        download: probes.download,
        upload: probes.upload,
        in_sync: ctx.in_sync,
        recent_touch_events: ctx.recent_touch_events,
        offline_since: None,
        blackscreen_since: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{Connection, Deployment, OsClass};
    use crate::state::{ApplicationState, LoginOutcome, Trinary};
    use crate::sysinfo::{interpret, ApplicationPolicy, Sysinfo};

    fn system(deployed: bool, last_sync: Option<i64>) -> System {
        System {
            id: 9,
            address: "10.8.0.9".parse().unwrap(),
            os: OsClass::ArchLinux,
            deployment: deployed.then_some(Deployment {
                id: 1,
                connection: Connection::Dsl,
            }),
            last_sync,
            is_virtual: false,
        }
    }

    #[test]
    fn sync_state_follows_last_sync() {
        let now = 1_000_000;
        assert_eq!(sync_state(&system(true, Some(now - 60)), now, 86_400), Some(true));
        assert_eq!(sync_state(&system(true, Some(now - 90_000)), now, 86_400), Some(false));
        assert_eq!(sync_state(&system(true, None), now, 86_400), Some(false));
        assert_eq!(sync_state(&system(false, Some(now)), now, 86_400), None);
    }

    #[test]
    fn assembles_probe_and_interpretation_fields() {
        let doc = Sysinfo::from_json(
            br#"{"application": {"name": "air", "version": "2.1"}, "root_ro": true, "efi": {"mounted": true}}"#,
        )
        .unwrap();
        let probes = ProbeReport {
            icmp_request: true,
            ssh: LoginOutcome::NotApplicable,
            http_request: Trinary::Success,
            sysinfo: doc.clone(),
            download: Some(2048),
            upload: None,
            bandwidth_attempted: true,
        };
        let ctx = CheckContext {
            system: 9,
            timestamp: 1_700_000_000,
            in_sync: Some(true),
            recent_touch_events: Some(3),
        };

        let result = assemble(ctx, &probes, interpret(&doc, ApplicationPolicy::NameLookup));
        assert_eq!(result.system, 9);
        assert_eq!(result.timestamp, 1_700_000_000);
        assert_eq!(result.ssh_login, Trinary::Unsupported);
        assert_eq!(result.ssh_outcome, LoginOutcome::NotApplicable);
        assert_eq!(result.application_state, ApplicationState::Air);
        assert_eq!(result.application_version.as_deref(), Some("2.1"));
        assert_eq!(result.root_not_ro, Trinary::Failed);
        assert_eq!(result.efi_mount_ok, Trinary::Success);
        assert_eq!(result.smart_check, Trinary::Unsupported);
        assert_eq!(result.download, Some(2048));
        assert_eq!(result.upload, None);
        assert_eq!(result.recent_touch_events, Some(3));
        assert!(result.online());
        assert_eq!(result.offline_since, None);
        assert_eq!(result.blackscreen_since, None);
    }

    #[test]
    fn assembly_is_deterministic() {
        let probes = ProbeReport::default();
        let ctx = CheckContext {
            system: 1,
            timestamp: 5,
            in_sync: None,
            recent_touch_events: None,
        };
        let interp = interpret(&probes.sysinfo, ApplicationPolicy::NameLookup);
        assert_eq!(
            assemble(ctx, &probes, interp.clone()),
            assemble(ctx, &probes, interp)
        );
    }
}

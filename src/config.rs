//! Merged configuration: environment variables override a config file
//! (path from `ORCHESTRATOR_CONFIG`, default `config.json`), which
//! overrides built-in defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

fn default_job_command() -> String {
    "./gradlew connectedAndroidTest".to_string()
}

fn default_true() -> bool {
    true
}

fn default_virtwificonnector_apk() -> String {
    "virtwificonnector-debug.apk".to_string()
}

fn default_permission_approve_buttons() -> Vec<String> {
    vec!["right".to_string(), "right".to_string(), "ret".to_string()]
}

fn default_vnc_recorder_output() -> String {
    "qemu_recording.mp4".to_string()
}

fn default_vnc_recorder_port() -> u16 {
    5910
}

fn default_qemu_bin() -> String {
    format!("qemu-system-{}", std::env::consts::ARCH)
}

fn default_qemu_args() -> Vec<String> {
    [
        // CPU
        "-cpu", "host", "-smp", "2,cores=1,sockets=1,threads=2",
        // RAM
        "-m", "4096",
        // Linux
        "-kernel", "kernel",
        "-append",
        "root=/dev/ram0 androidboot.selinux=permissive androidboot.hardware=android_x86_64 \
         console=ttyS0 RAMDISK=vdb SETUPWIZARD=0 SETUPWIZARD=0 SETUPWIZARD=0",
        "-initrd", "initrd.img",
        // Generic hardware
        "-audiodev", "none,id=audionull",
        "-device", "AC97,audiodev=audionull",
        "-netdev", "user,id=network,hostfwd=tcp::5555-:5555",
        "-device", "virtio-net-pci,netdev=network",
        "-chardev", "socket,id=serial0,server,path=/tmp/qemu-android.sock",
        "-serial", "chardev:serial0",
        "-chardev", "socket,id=monitor0,server,path=/tmp/qemu-monitor.sock",
        "-monitor", "chardev:monitor0",
        "-vga", "qxl",
        "-display", "vnc=127.0.0.1:10",
        // Drives and disk images
        "-drive", "index=0,if=virtio,id=system,file=system.sfs,format=raw,readonly",
        "-drive", "index=1,if=virtio,id=ramdisk,file=ramdisk.img,format=raw,readonly",
        "-drive", "if=none,id=usbstick,file=usb.img,format=raw",
        // USB devices
        "-usb",
        "-device", "usb-tablet,bus=usb-bus.0",
        "-device", "nec-usb-xhci,id=xhci",
        "-device", "usb-storage,id=usbdrive,bus=xhci.0,drive=usbstick",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_disable_packages() -> Vec<String> {
    [
        "com.google.android.ext.services",
        "com.google.android.googlequicksearchbox",
        "com.google.android.onetimeinitializer",
        "com.google.android.ext.shared",
        "com.google.android.setupwizard",
        "com.google.android.webview",
        "com.google.android.syncadapters.contacts",
        "com.google.android.packageinstaller",
        "com.google.android.partnersetup",
        "com.google.android.feedback",
        "com.google.android.printservice.recommendation",
        "com.google.android.syncadapters.calendar",
        "com.google.android.gsf.login",
        "com.google.android.backuptransport",
        "com.google.android.gms.setup",
        "com.google.android.apps.restore",
        "com.android.chrome",
        "com.android.vending",
        "com.google.android.gm",
        "com.google.android.gsf",
        "com.google.android.gms",
        "com.example.android.rssreader",
        "org.android_x86.analytics",
        "org.zeroxlab.util.tscal",
        "com.android.companiondevicemanager",
        "com.android.camera2",
        "com.android.gallery3d",
        "org.lineageos.eleven",
        "com.farmerbb.taskbar.androidx86",
        "com.android.captiveportallogin",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// The merged configuration driving a single orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub job_workdir: Option<String>,
    #[serde(default = "default_job_command")]
    pub job_command: String,

    #[serde(default = "default_true")]
    pub virtwifi_hack: bool,
    #[serde(default = "default_virtwificonnector_apk")]
    pub virtwificonnector_apk: String,

    #[serde(default = "default_true")]
    pub permission_approve: bool,
    #[serde(default = "default_permission_approve_buttons")]
    pub permission_approve_buttons: Vec<String>,

    #[serde(default)]
    pub vnc_recorder: bool,
    #[serde(default)]
    pub vnc_recorder_debug: bool,
    #[serde(default)]
    pub vnc_recorder_bin: Option<String>,
    #[serde(default = "default_vnc_recorder_output")]
    pub vnc_recorder_output: String,
    #[serde(default = "default_vnc_recorder_port")]
    pub vnc_recorder_port: u16,

    #[serde(default)]
    pub qemu_workdir: Option<String>,
    #[serde(default = "default_qemu_bin")]
    pub qemu_bin: String,
    #[serde(default)]
    pub qemu_debug: bool,
    #[serde(default)]
    pub qemu_force_kvm: bool,
    #[serde(default = "default_qemu_args")]
    pub qemu_args: Vec<String>,

    #[serde(default)]
    pub logcat_output: Option<String>,
    #[serde(default)]
    pub dmesg_output: Option<String>,
    #[serde(default)]
    pub bugreport_output: Option<String>,

    #[serde(default = "default_disable_packages")]
    pub disable_packages: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            job_workdir: None,
            job_command: default_job_command(),
            virtwifi_hack: true,
            virtwificonnector_apk: default_virtwificonnector_apk(),
            permission_approve: true,
            permission_approve_buttons: default_permission_approve_buttons(),
            vnc_recorder: false,
            vnc_recorder_debug: false,
            vnc_recorder_bin: None,
            vnc_recorder_output: default_vnc_recorder_output(),
            vnc_recorder_port: default_vnc_recorder_port(),
            qemu_workdir: None,
            qemu_bin: default_qemu_bin(),
            qemu_debug: false,
            qemu_force_kvm: false,
            qemu_args: default_qemu_args(),
            logcat_output: None,
            dmesg_output: None,
            bugreport_output: None,
            disable_packages: default_disable_packages(),
        }
    }
}

fn env_bool(var: &str) -> Option<bool> {
    std::env::var(var).ok().map(|v| v.trim() == "1")
}

fn env_string(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

fn env_u16(var: &str) -> Option<u16> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

impl OrchestratorConfig {
    /// Load the merged configuration: defaults, overlaid by the config
    /// file named by `ORCHESTRATOR_CONFIG` (default `config.json`) if it
    /// exists and is readable, overlaid by recognized environment
    /// variables.
    pub fn load() -> anyhow::Result<Self> {
        let explicit_path = std::env::var("ORCHESTRATOR_CONFIG").ok();
        let path = explicit_path.clone().unwrap_or_else(|| "config.json".to_string());

        let mut config = if Path::new(&path).is_file() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            if explicit_path.is_some() {
                warn!(path = %path, "config file does not exist or is not readable, using defaults");
            }
            OrchestratorConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_string("JOB_WORKDIR") {
            self.job_workdir = Some(v);
        }
        if let Some(v) = env_string("JOB_COMMAND") {
            self.job_command = v;
        }
        if let Some(v) = env_bool("VIRTWIFI_HACK") {
            self.virtwifi_hack = v;
        }
        if let Some(v) = env_string("VIRTWIFICONNECTOR_APK") {
            self.virtwificonnector_apk = v;
        }
        if let Some(v) = env_bool("PERMISSION_APPROVE") {
            self.permission_approve = v;
        }
        if let Some(v) = env_bool("VNC_RECORDER") {
            self.vnc_recorder = v;
        }
        if let Some(v) = env_bool("VNC_RECORDER_DEBUG") {
            self.vnc_recorder_debug = v;
        }
        if let Some(v) = env_string("VNC_RECORDER_BIN") {
            self.vnc_recorder_bin = Some(v);
        }
        if let Some(v) = env_string("VNC_RECORDER_OUTPUT") {
            self.vnc_recorder_output = v;
        }
        if let Some(v) = env_u16("VNC_RECORDER_PORT") {
            self.vnc_recorder_port = v;
        }
        if let Some(v) = env_string("QEMU_WORKDIR") {
            self.qemu_workdir = Some(v);
        }
        if let Some(v) = env_string("QEMU_BIN") {
            self.qemu_bin = v;
        }
        if let Some(v) = env_bool("QEMU_DEBUG") {
            self.qemu_debug = v;
        }
        if let Some(v) = env_bool("QEMU_FORCE_KVM") {
            self.qemu_force_kvm = v;
        }
        if let Some(v) = env_string("LOGCAT_OUTPUT") {
            self.logcat_output = Some(v);
        }
        if let Some(v) = env_string("DMESG_OUTPUT") {
            self.dmesg_output = Some(v);
        }
        if let Some(v) = env_string("BUGREPORT_OUTPUT") {
            self.bugreport_output = Some(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variable mutation is process-global; serialize the env-sensitive tests.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_original_implementation() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.job_command, "./gradlew connectedAndroidTest");
        assert!(cfg.virtwifi_hack);
        assert!(cfg.permission_approve);
        assert!(!cfg.vnc_recorder);
        assert_eq!(cfg.vnc_recorder_port, 5910);
        assert_eq!(cfg.disable_packages.len(), 30);
        assert!(!cfg.qemu_args.contains(&"-enable-kvm".to_string()));
    }

    #[test]
    fn env_overrides_take_precedence_over_file_and_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("JOB_COMMAND", "true");
        std::env::set_var("VIRTWIFI_HACK", "0");
        let mut cfg = OrchestratorConfig::default();
        cfg.apply_env_overrides();
        assert_eq!(cfg.job_command, "true");
        assert!(!cfg.virtwifi_hack);
        std::env::remove_var("JOB_COMMAND");
        std::env::remove_var("VIRTWIFI_HACK");
    }

    #[test]
    fn env_bool_parses_zero_one_convention() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("QEMU_DEBUG", "1");
        assert_eq!(env_bool("QEMU_DEBUG"), Some(true));
        std::env::set_var("QEMU_DEBUG", "0");
        assert_eq!(env_bool("QEMU_DEBUG"), Some(false));
        std::env::remove_var("QEMU_DEBUG");
    }
}

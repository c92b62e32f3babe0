/// Returns the default destructive-pattern list as (pattern, reason) tuples.
/// A technique whose command matches any pattern is excluded from safe-mode
/// executions. The list catches obvious destructive actions; catalogs can
/// replace it wholesale via configuration.
pub fn default_destructive_patterns() -> Vec<(String, String)> {
    vec![
        // File and volume destruction
        (r"(?i)\brm\b\s".into(), "File deletion".into()),
        (r"(?i)\bdel\b\s+/[fsq]".into(), "Forced file deletion".into()),
        (r"(?i)\bformat\b\s+[a-z]:".into(), "Volume formatting".into()),
        (r"(?i)\bmkfs\b".into(), "Filesystem formatting".into()),
        (r"(?i)\bdd\b\s.*of=/dev/".into(), "Direct device writes".into()),
        (r"(?i)\bcipher\b\s+/w".into(), "Free-space wiping".into()),
        // Backup and recovery tampering (ransomware staples)
        (r"(?i)vssadmin\s+delete\s+shadows".into(), "Shadow copy deletion".into()),
        (r"(?i)wbadmin\s+delete".into(), "Backup catalog deletion".into()),
        (r"(?i)bcdedit\s+.*recoveryenabled\s+no".into(), "Recovery tampering".into()),
        // Host availability
        (r"(?i)\bshutdown\b".into(), "System shutdown".into()),
        (r"(?i)\breboot\b".into(), "System reboot".into()),
        (r"(?i)\bhalt\b".into(), "System halt".into()),
        (r"(?i)\bpoweroff\b".into(), "System poweroff".into()),
        // Service and process disruption
        (r"(?i)taskkill\s+.*\s/f".into(), "Forced process termination".into()),
        (r"(?i)systemctl\s+(stop|disable)\b".into(), "Service disruption".into()),
        (r"(?i)\bsc\b\s+(stop|delete)\b".into(), "Service disruption".into()),
        // Account and credential tampering
        (r"(?i)net\s+user\s+.*\s+/(add|delete)".into(), "Account tampering".into()),
        (r"(?i)\bpasswd\b".into(), "Credential tampering".into()),
        (r"(?i)\buserdel\b".into(), "Account deletion".into()),
        // Registry and firewall destruction
        (r"(?i)reg\s+delete\b".into(), "Registry deletion".into()),
        (r"(?i)netsh\s+.*firewall\s+set\s+.*\s+off".into(), "Firewall disablement".into()),
    ]
}

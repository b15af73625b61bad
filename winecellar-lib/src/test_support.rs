//! Shell-script stand-ins for Wine and winetricks

use crate::config::{Settings, SettingsStore};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub(crate) fn write_script(path: &Path, body: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Install a fake toolchain at `root` whose `--version` prints `version_output`.
///
/// Behavior of `bin/wine64 <program> ...`:
/// - appends its arguments to `$FAKE_WINE_LOG` when set, and for `regedit`
///   a `script <unix path>` line while the imported file exists
/// - exits 1 when `$FAKE_WINE_FAIL` names the program
/// - `wineboot` creates `drive_c` (and `syswow64` for win64)
/// - `*SteamSetup.exe` drops a `steam.exe` under Program Files (x86)
/// - `env-dump` prints its arguments and environment
pub(crate) fn fake_wine(root: &Path, version_output: &str) -> PathBuf {
    let script = format!(
        r#"#!/bin/sh
if [ "$1" = "--version" ]; then
  echo '{version}'
  exit 0
fi
if [ -n "$FAKE_WINE_LOG" ]; then
  printf '%s\n' "$*" >> "$FAKE_WINE_LOG"
  if [ "$1" = "regedit" ]; then
    script=$(printf '%s' "$3" | sed -e 's/^Z://' -e 's/\\/\//g')
    if [ -f "$script" ]; then
      echo "script $script" >> "$FAKE_WINE_LOG"
    fi
  fi
fi
if [ -n "$FAKE_WINE_FAIL" ] && [ "$1" = "$FAKE_WINE_FAIL" ]; then
  echo "forced failure of $1" >&2
  exit 1
fi
case "$1" in
  wineboot)
    mkdir -p "$WINEPREFIX/drive_c/windows/system32"
    if [ "$WINEARCH" = "win64" ]; then
      mkdir -p "$WINEPREFIX/drive_c/windows/syswow64"
    fi
    ;;
  *SteamSetup.exe)
    mkdir -p "$WINEPREFIX/drive_c/Program Files (x86)/Steam"
    touch "$WINEPREFIX/drive_c/Program Files (x86)/Steam/steam.exe"
    ;;
  env-dump)
    echo "ARGS=$*"
    env
    ;;
esac
exit 0
"#,
        version = version_output
    );

    write_script(&root.join("bin").join("wine64"), &script);
    write_script(
        &root.join("bin").join("wineserver"),
        "#!/bin/sh\nif [ -n \"$FAKE_WINE_LOG\" ]; then echo \"wineserver $*\" >> \"$FAKE_WINE_LOG\"; fi\nexit 0\n",
    );
    root.to_path_buf()
}

/// Place a fake winetricks in the cache slot under `app_root`.
///
/// Each call appends its arguments to `log` and records the verb in the
/// prefix's `winetricks.log`. The verb `brokenverb` fails with exit code 3.
pub(crate) fn fake_winetricks(app_root: &Path, log: &Path) -> PathBuf {
    let path = app_root.join("winetricks").join("winetricks");
    let script = format!(
        r#"#!/bin/sh
echo "$*" >> '{log}'
verb="$2"
if [ "$verb" = "brokenverb" ]; then
  exit 3
fi
mkdir -p "$WINEPREFIX"
echo "$verb" >> "$WINEPREFIX/winetricks.log"
exit 0
"#,
        log = log.display()
    );
    write_script(&path, &script);
    path
}

pub(crate) fn settings_store(root: &Path) -> Arc<SettingsStore> {
    Arc::new(SettingsStore::new(root.join("config.json"), Settings::default()))
}

/// Answer one HTTP request on a loopback port with `body` and return the
/// URL of `file_name` on that server.
pub(crate) async fn serve_once(file_name: &str, body: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = vec![0u8; 4096];
        let _ = socket.read(&mut request).await;
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(&body).await.unwrap();
        socket.shutdown().await.unwrap();
    });
    format!("http://{}/{}", address, file_name)
}

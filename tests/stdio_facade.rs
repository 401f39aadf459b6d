use std::{
    io::{BufRead, BufReader, Write},
    path::PathBuf,
    process::{Command, Stdio},
};

use serde_json::{Value, json};

fn pathdex_bin() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Ok(bin) = std::env::var("CARGO_BIN_EXE_pathdex") {
        return Ok(PathBuf::from(bin));
    }

    let mut path = std::env::current_exe()?;
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("pathdex");

    if cfg!(windows) {
        path.set_extension("exe");
    }

    Ok(path)
}

#[test]
fn serve_round_trips_json_lines() -> Result<(), Box<dyn std::error::Error>> {
    let data = tempfile::tempdir()?;
    let volume = tempfile::tempdir()?;
    let file = volume.path().join("notes.txt");
    std::fs::write(&file, b"")?;
    std::fs::write(
        data.path().join("settings.json"),
        serde_json::to_string(&json!({ "disks": [volume.path()] }))?,
    )?;

    let mut child = Command::new(pathdex_bin()?)
        .arg("-q")
        .arg("serve")
        .env("PATHDEX_DATA_DIR", data.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;
    let mut stdin = child.stdin.take().expect("stdin");
    let mut stdout = BufReader::new(child.stdout.take().expect("stdout"));

    type Reply = Result<Value, Box<dyn std::error::Error>>;
    let mut call = |request: Value| -> Reply {
        writeln!(stdin, "{request}")?;
        stdin.flush()?;
        let mut line = String::new();
        stdout.read_line(&mut line)?;
        Ok(serde_json::from_str(&line)?)
    };

    let status = call(json!({ "id": 1, "op": "status" }))?;
    assert_eq!(status["id"], json!(1));
    assert_eq!(status["result"]["status"], json!("NORMAL"));

    let added = call(json!({
        "id": 2,
        "op": "fileAdded",
        "path": file.to_string_lossy(),
    }))?;
    assert_eq!(added["result"]["accepted"], json!(true));

    let suffix = call(json!({
        "id": 3,
        "op": "addSuffix",
        "suffix": "txt",
        "priority": 2,
    }))?;
    assert_eq!(suffix["ok"], json!(true));

    let prepared =
        call(json!({ "id": 4, "op": "prepareSearch", "query": "notes" }))?;
    assert_eq!(prepared["ok"], json!(true));
    let uuid = prepared["result"]["uuid"].clone();

    let page = call(json!({
        "id": 5,
        "op": "results",
        "uuid": uuid,
        "bucket": "fast",
    }))?;
    assert_eq!(page["result"]["uuid"], uuid);
    assert!(page["result"]["data"].is_array());

    let missing = call(json!({
        "id": 6,
        "op": "results",
        "uuid": "00000000-0000-0000-0000-000000000000",
    }))?;
    assert_eq!(missing["ok"], json!(false));

    let closed = call(json!({ "id": 7, "op": "close" }))?;
    assert_eq!(closed["ok"], json!(true));
    drop(stdin);
    assert!(child.wait()?.success());
    Ok(())
}

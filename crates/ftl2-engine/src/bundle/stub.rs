//! Entry stub embedded into every bundle.
//!
//! The stub is what actually runs on a target: `--rpc` turns it into a
//! gate speaking the framed protocol on stdin/stdout, `--run` executes a
//! single module for diagnostics. Bump [`STUB_VERSION`] whenever the
//! template changes; the version participates in the bundle fingerprint so
//! stale gates are never reused against a newer controller.

/// Participates in the bundle fingerprint.
pub const STUB_VERSION: &str = "ftl2-stub-3";

/// Python source for `__main__.py` inside the bundle archive.
///
/// Protocol notes mirrored from the controller side: frames are a 4-byte
/// big-endian length then JSON; events are interleaved before the single
/// `result`; the gate never writes non-frame bytes to stdout. Module
/// processes report events as `FTL2-EVENT: {json}` lines on stderr, which
/// the stub forwards as `event` frames.
pub const ENTRY_STUB: &str = r#"#!/usr/bin/env python3
"""FTL2 gate entry stub. Modes: --rpc (framed stream), --run NAME JSON."""
import json
import os
import struct
import subprocess
import sys

HERE = os.path.dirname(os.path.abspath(__file__))
MODULE_DIR = os.path.join(HERE, "modules")
LIB_DIR = os.path.join(HERE, "ftl2_lib")
EVENT_PREFIX = "FTL2-EVENT: "


def read_frame(stream):
    prefix = stream.read(4)
    if not prefix:
        return None
    if len(prefix) < 4:
        raise IOError("stream ended mid-prefix")
    length = struct.unpack(">I", prefix)[0]
    body = b""
    while len(body) < length:
        chunk = stream.read(length - len(body))
        if not chunk:
            raise IOError("stream ended mid-frame")
        body += chunk
    return json.loads(body.decode("utf-8"))


def write_frame(stream, message):
    body = json.dumps(message).encode("utf-8")
    stream.write(struct.pack(">I", len(body)))
    stream.write(body)
    stream.flush()


def load_manifest():
    with open(os.path.join(HERE, "manifest.json")) as f:
        return json.load(f)


def module_path(name):
    bare = name.rsplit(".", 1)[-1]
    path = os.path.join(MODULE_DIR, bare + ".py")
    return path if os.path.exists(path) else None


def run_module(name, params, check_mode, on_event):
    path = module_path(name)
    if path is None:
        return {"success": False, "changed": False,
                "output": {"failed": True, "msg": "module not in bundle: %s" % name}}
    env = dict(os.environ)
    env["PYTHONPATH"] = LIB_DIR + os.pathsep + env.get("PYTHONPATH", "")
    if check_mode:
        params = dict(params or {})
        params["_check_mode"] = True
    proc = subprocess.Popen(
        [sys.executable, path],
        stdin=subprocess.PIPE, stdout=subprocess.PIPE, stderr=subprocess.PIPE,
        env=env, text=True)
    stdout, stderr = proc.communicate(json.dumps(params or {}))
    for line in stderr.splitlines():
        if line.startswith(EVENT_PREFIX):
            try:
                on_event(json.loads(line[len(EVENT_PREFIX):]))
            except ValueError:
                pass
    try:
        output = json.loads(stdout) if stdout.strip() else {}
    except ValueError:
        output = {"failed": True, "msg": "module wrote non-JSON output",
                  "raw": stdout[:4096]}
    success = proc.returncode == 0 and not output.get("failed", False)
    result = {"success": success, "changed": bool(output.get("changed", False)),
              "output": output}
    if not success:
        result["error"] = output.get("msg", "module exited %s" % proc.returncode)
    return result


def serve_rpc():
    stdin = sys.stdin.buffer
    stdout = sys.stdout.buffer
    write_frame(stdout, {"type": "ready"})
    while True:
        try:
            frame = read_frame(stdin)
        except IOError:
            return 1
        if frame is None:
            return 0
        kind = frame.get("type")
        if kind == "shutdown":
            return 0
        rid = frame.get("id", 0)
        if kind == "execute":
            def forward(event, rid=rid):
                write_frame(stdout, {"type": "event", "id": rid,
                                     "kind": event.get("kind", "log"),
                                     "payload": event.get("payload", {})})
            result = run_module(frame.get("module", ""), frame.get("params"),
                                frame.get("check_mode", False), forward)
            result.update({"type": "result", "id": rid})
            write_frame(stdout, result)
        elif kind == "info":
            manifest = load_manifest()
            write_frame(stdout, {"type": "result", "id": rid, "success": True,
                                 "changed": False,
                                 "output": {"python": sys.version.split()[0],
                                            "platform": sys.platform,
                                            "fingerprint": manifest.get("fingerprint"),
                                            "stub": manifest.get("stub_version")}})
        elif kind == "list_modules":
            manifest = load_manifest()
            write_frame(stdout, {"type": "result", "id": rid, "success": True,
                                 "changed": False,
                                 "output": {"modules": manifest.get("modules", [])}})
        else:
            write_frame(stdout, {"type": "error", "id": rid,
                                 "message": "unknown request type: %s" % kind})


def main(argv):
    if len(argv) >= 1 and argv[0] == "--rpc":
        return serve_rpc()
    if len(argv) >= 3 and argv[0] == "--run":
        result = run_module(argv[1], json.loads(argv[2]), False,
                            lambda e: sys.stderr.write(EVENT_PREFIX + json.dumps(e) + "\n"))
        print(json.dumps(result, indent=2))
        return 0 if result["success"] else 1
    sys.stderr.write("usage: __main__.py --rpc | --run MODULE PARAMS_JSON\n")
    return 2


if __name__ == "__main__":
    sys.exit(main(sys.argv[1:]))
"#;

//! The single viewer page. There is no frontend build step: the page is
//! small enough to template directly, substituting the request host into
//! the signaling URL.

/// Render the viewer page for a given `Host` header value, used to build
/// the `ws://` / `wss://` signaling URL from the browser.
pub fn viewer_page(host: &str) -> String {
    // wss:// termination is left to a reverse proxy in front of this server.
    let scheme = "ws";

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>H.264 relay viewer</title>
<style>
  body {{ margin: 0; background: #111; display: flex; justify-content: center; align-items: center; min-height: 100vh; }}
  video {{ max-width: 100%; max-height: 100vh; background: #000; }}
  #status {{ position: fixed; top: 8px; left: 8px; color: #ccc; font-family: monospace; font-size: 12px; }}
</style>
</head>
<body>
<div id="status">connecting...</div>
<video id="video" autoplay playsinline muted></video>
<script>
const KIND_OFFER = 0, KIND_ANSWER = 1, KIND_ICE_CANDIDATE = 2, KIND_STOP = 3;
const clientId = Math.random().toString(36).slice(2) + Date.now().toString(36);
const statusEl = document.getElementById("status");
const video = document.getElementById("video");

const ws = new WebSocket("{scheme}://{host}/ws?clientID=" + clientId);
const pc = new RTCPeerConnection({{ iceServers: [{{ urls: "stun:stun.l.google.com:19302" }}] }});
pc.addTransceiver("video", {{ direction: "recvonly" }});

pc.ontrack = (event) => {{
  video.srcObject = event.streams[0];
  statusEl.textContent = "streaming";
}};

pc.onicecandidate = (event) => {{
  if (!event.candidate) return;
  ws.send(JSON.stringify({{
    client_id: clientId,
    kind: KIND_ICE_CANDIDATE,
    client_ice_candidate: event.candidate.toJSON(),
  }}));
}};

pc.oniceconnectionstatechange = () => {{
  statusEl.textContent = pc.iceConnectionState;
}};

ws.onopen = async () => {{
  const offer = await pc.createOffer();
  await pc.setLocalDescription(offer);
  ws.send(JSON.stringify({{
    client_id: clientId,
    kind: KIND_OFFER,
    offer: {{ sdp: offer.sdp }},
  }}));
}};

ws.onmessage = async (event) => {{
  const msg = JSON.parse(event.data);
  if (msg.kind === KIND_ANSWER && msg.answer) {{
    await pc.setRemoteDescription({{ type: "answer", sdp: msg.answer.sdp }});
  }} else if (msg.kind === KIND_ICE_CANDIDATE && msg.ice_candidate) {{
    await pc.addIceCandidate(msg.ice_candidate);
  }}
}};

ws.onclose = () => {{
  statusEl.textContent = "disconnected";
}};

window.addEventListener("beforeunload", () => {{
  ws.send(JSON.stringify({{ client_id: clientId, kind: KIND_STOP }}));
}});
</script>
</body>
</html>"#,
        scheme = scheme,
        host = host,
    )
}

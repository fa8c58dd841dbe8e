//! RTSP authentication: Basic and Digest (MD5 and SHA-256, `qop=auth`),
//! for the client (answering challenges) and the server (issuing and
//! verifying them).

use rand::Rng;

use crate::Error;

/// Username and password for one peer.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"...")
            .finish()
    }
}

/// Converts from an RTSP method to a digest method. Extension methods
/// (ANNOUNCE, RECORD) authenticate with their literal names.
pub(crate) fn http_method(method: &rtsp_types::Method) -> digest_auth::HttpMethod {
    use rtsp_types::Method;
    digest_auth::HttpMethod(
        match method {
            Method::Describe => "DESCRIBE",
            Method::GetParameter => "GET_PARAMETER",
            Method::Options => "OPTIONS",
            Method::Pause => "PAUSE",
            Method::Play => "PLAY",
            Method::PlayNotify => "PLAY_NOTIFY",
            Method::Redirect => "REDIRECT",
            Method::Setup => "SETUP",
            Method::SetParameter => "SET_PARAMETER",
            Method::Announce => "ANNOUNCE",
            Method::Record => "RECORD",
            Method::Teardown => "TEARDOWN",
            Method::Extension(m) => return digest_auth::HttpMethod(m.to_string().into()),
        }
        .into(),
    )
}

/// Computes the `Authorization` header value answering `challenge`.
pub(crate) fn respond(
    challenge: &mut RequestedAuth,
    creds: &Credentials,
    method: &rtsp_types::Method,
    uri: &str,
) -> Result<String, Error> {
    match challenge {
        RequestedAuth::Basic => Ok(format!(
            "Basic {}",
            base64::encode(format!("{}:{}", creds.username, creds.password))
        )),
        RequestedAuth::Digest(h) => {
            let ctx = digest_auth::AuthContext::new_with_method(
                &creds.username,
                &creds.password,
                uri,
                Option::<&'static [u8]>::None,
                http_method(method),
            );
            let authorization = h
                .respond(&ctx)
                .map_err(|e| Error::Auth(format!("can't answer digest challenge: {}", e)))?;
            Ok(authorization.to_string())
        }
    }
}

/// A challenge received in `WWW-Authenticate`, as remembered by the client
/// between the 401 and the retry.
pub(crate) enum RequestedAuth {
    Basic,
    Digest(digest_auth::WwwAuthenticateHeader),
}

impl RequestedAuth {
    pub(crate) fn parse(www_authenticate: &str) -> Result<Self, Error> {
        let www_authenticate = www_authenticate.trim();
        if www_authenticate.starts_with("Digest ") {
            let h = digest_auth::WwwAuthenticateHeader::parse(www_authenticate)
                .map_err(|e| Error::Auth(format!("bad WWW-Authenticate: {}", e)))?;
            Ok(RequestedAuth::Digest(h))
        } else if www_authenticate.starts_with("Basic ") || www_authenticate == "Basic" {
            Ok(RequestedAuth::Basic)
        } else {
            Err(Error::Auth(format!(
                "unsupported authentication scheme in {:?}",
                www_authenticate
            )))
        }
    }
}

/// Per-connection server-side authenticator. Issues a Digest challenge
/// (with a connection-scoped nonce) and verifies answers; Basic answers
/// are accepted too.
pub(crate) struct Validator {
    creds: Credentials,
    realm: String,
    nonce: String,
}

impl Validator {
    pub(crate) fn new(creds: Credentials, realm: &str) -> Self {
        let nonce: String = {
            let mut rng = rand::thread_rng();
            (0..16)
                .map(|_| format!("{:02x}", rng.gen::<u8>()))
                .collect()
        };
        Validator {
            creds,
            realm: realm.to_owned(),
            nonce,
        }
    }

    /// The `WWW-Authenticate` value sent with a 401.
    pub(crate) fn challenge(&self) -> String {
        format!(
            "Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5, qop=\"auth\"",
            self.realm, self.nonce
        )
    }

    /// Checks an `Authorization` header against the configured credentials.
    pub(crate) fn check(
        &self,
        authorization: Option<&str>,
        method: &rtsp_types::Method,
    ) -> Result<(), Error> {
        let authorization = match authorization {
            None => return Err(Error::Auth("no Authorization header".to_owned())),
            Some(a) => a.trim(),
        };
        if let Some(v) = authorization.strip_prefix("Basic ") {
            let decoded = base64::decode(v.trim())
                .map_err(|_| Error::Auth("bad Basic base64".to_owned()))?;
            let expected = format!("{}:{}", self.creds.username, self.creds.password);
            if decoded == expected.as_bytes() {
                return Ok(());
            }
            return Err(Error::Auth("bad Basic credentials".to_owned()));
        }
        if authorization.starts_with("Digest ") {
            let theirs = digest_auth::AuthorizationHeader::parse(authorization)
                .map_err(|e| Error::Auth(format!("bad Authorization: {}", e)))?;
            if theirs.username != self.creds.username {
                return Err(Error::Auth("unknown user".to_owned()));
            }
            if theirs.nonce != self.nonce {
                return Err(Error::Auth("stale nonce".to_owned()));
            }
            // Recompute the response with our secrets and the client's
            // cnonce/nc; a match proves knowledge of the password.
            let mut prompt = digest_auth::WwwAuthenticateHeader {
                domain: None,
                realm: self.realm.clone(),
                nonce: self.nonce.clone(),
                opaque: None,
                stale: false,
                algorithm: theirs.algorithm,
                qop: theirs.qop.map(|q| vec![q]),
                userhash: false,
                charset: digest_auth::Charset::ASCII,
                nc: theirs.nc.wrapping_sub(1),
            };
            let mut ctx = digest_auth::AuthContext::new_with_method(
                &self.creds.username,
                &self.creds.password,
                &theirs.uri,
                Option::<&'static [u8]>::None,
                http_method(method),
            );
            if let Some(cnonce) = &theirs.cnonce {
                ctx.set_custom_cnonce(cnonce.clone());
            }
            let expected = prompt
                .respond(&ctx)
                .map_err(|e| Error::Auth(format!("can't verify digest: {}", e)))?;
            if expected.response == theirs.response {
                return Ok(());
            }
            return Err(Error::Auth("bad Digest response".to_owned()));
        }
        Err(Error::Auth("unsupported Authorization scheme".to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_round_trip() {
        let creds = Credentials {
            username: "user".to_owned(),
            password: "pass".to_owned(),
        };
        let v = Validator::new(creds.clone(), "r");
        let mut challenge = RequestedAuth::Basic;
        let hdr = respond(
            &mut challenge,
            &creds,
            &rtsp_types::Method::Describe,
            "rtsp://example/stream",
        )
        .unwrap();
        v.check(Some(hdr.as_str()), &rtsp_types::Method::Describe).unwrap();
        assert!(v
            .check(Some("Basic dXNlcjp3cm9uZw=="), &rtsp_types::Method::Describe)
            .is_err());
    }

    #[test]
    fn digest_round_trip() {
        let creds = Credentials {
            username: "user".to_owned(),
            password: "pass".to_owned(),
        };
        let v = Validator::new(creds.clone(), "r");
        let mut challenge = RequestedAuth::parse(&v.challenge()).unwrap();
        let hdr = respond(
            &mut challenge,
            &creds,
            &rtsp_types::Method::Describe,
            "rtsp://example/stream",
        )
        .unwrap();
        v.check(Some(hdr.as_str()), &rtsp_types::Method::Describe).unwrap();
        // A different method must not verify against the same response.
        assert!(v.check(Some(hdr.as_str()), &rtsp_types::Method::Setup).is_err());
    }

    #[test]
    fn missing_header_rejected() {
        let v = Validator::new(
            Credentials {
                username: "u".to_owned(),
                password: "p".to_owned(),
            },
            "r",
        );
        assert!(v.check(None, &rtsp_types::Method::Describe).is_err());
    }
}

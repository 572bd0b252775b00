use salvo::http::header::CONTENT_TYPE;
use salvo::prelude::*;

use crate::web::web_state;

#[handler]
pub async fn metrics_endpoint(res: &mut Response) {
    let _ = res.add_header(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8", true);
    let _ = res.write_body(web_state().core.metrics().render());
}

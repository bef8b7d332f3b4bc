use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::routes::{
    abort_run_handler, get_status_handler, json_error_handler, post_run_handler,
};
use crate::worker::RunHandle;

pub fn build_server(server_config: ServerConfig, runner: RunHandle) -> std::io::Result<Server> {
    let runner = web::Data::new(runner);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(runner.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .wrap(middleware::Logger::default())
            .service(post_run_handler)
            .service(abort_run_handler)
            .service(get_status_handler)
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(12345),
    ))?
    .run();

    Ok(server)
}
